use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use ledger_events::events::{
    ChannelAdapter, ClientProviders, ClientSettings, EventBody, EventType, EventsClient, Interest,
    KeepaliveParams, StaticEventsConfig,
};
use ledger_events::signing::{Ed25519SigningManager, SigningIdentity};
use secrecy::Secret;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let address = "grpcs://peer0.org1.example.com:7053".to_string();
    let signing_seed = vec![0u8; 32]; // REPLACE_WITH_ED25519_SEED
    let certificate_pem = "REPLACE_WITH_ENROLLMENT_CERT_PEM".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let settings = ClientSettings::new(address)
            .with_allow_insecure(true)
            .with_keepalive(KeepaliveParams {
                time: Duration::from_secs(30),
                timeout: Duration::from_secs(10),
                permit_without_stream: false,
            });
        let providers = ClientProviders {
            config: Arc::new(StaticEventsConfig::default()),
            signing: Some(Arc::new(Ed25519SigningManager)),
        };
        let identity = SigningIdentity::new("Org1MSP", certificate_pem, Secret::new(signing_seed));
        let (adapter, receiver) = ChannelAdapter::new(vec![
            Interest::new(EventType::Block),
            Interest::chaincode("asset-transfer", "transfer").on_channel("mychannel"),
        ]);

        let (mut client, advisory) =
            EventsClient::new(settings, providers, Some(Arc::new(identity)), Arc::new(adapter));
        if let Some(advisory) = advisory {
            println!("warning: {advisory}");
        }

        client.start().await?;
        let (mut events, mut status) = receiver.split();
        let mut received = 0;
        loop {
            tokio::select! {
                Some(message) = events.recv() => {
                    if let Some(EventBody::Event { payload }) = message.event {
                        received += 1;
                        println!("event #{received}: {payload}");
                        if received == 10 {
                            break;
                        }
                    }
                }
                update = status.recv() => {
                    println!("stream status: {update:?}");
                    break;
                }
            }
        }

        client.stop().await?;
        Ok::<(), Box<dyn Error>>(())
    })
}

//! KH7008 channel configuration through the simulated amplifier.

use std::time::Duration;

use flex_daq::instrument::{ChannelConfig, ChannelUpdate, Kh7008};
use flex_daq::sim::SimulatedAmplifier;
use flex_daq::transport::{MockHandle, MockLink, TransportClient};
use flex_daq::validator::{self, ParamValue, Parameter};
use flex_daq::FlexError;

fn amplifier_transport(sim: SimulatedAmplifier) -> (TransportClient, MockHandle<SimulatedAmplifier>) {
    let link = MockLink::new(sim);
    let handle = link.handle();
    let transport =
        TransportClient::with_link("mock://kh7008", Box::new(link), Duration::from_secs(1));
    (transport, handle)
}

fn config(channel: i64) -> ChannelConfig {
    ChannelConfig {
        channel,
        gain: 100,
        input: "DIFF".into(),
        shunt: 10_000_000,
        couple: "AC".into(),
        filter: "ON".into(),
    }
}

#[tokio::test]
async fn test_partial_update_changes_only_named_fields() {
    let (transport, handle) = amplifier_transport(SimulatedAmplifier::new());
    let amplifier = Kh7008::new(&transport);

    let before = amplifier.channel(3).await.unwrap();
    let applied = amplifier
        .update_channel(3, &ChannelUpdate::new().gain(100).shunt(5000))
        .await
        .unwrap();

    assert_eq!(applied.gain, 100);
    assert_eq!(applied.shunt, 5000);
    assert_eq!(applied.input, before.input);
    assert_eq!(applied.couple, before.couple);
    assert_eq!(applied.filter, before.filter);
    assert_eq!(amplifier.channel(3).await.unwrap(), applied);

    // Other channels are untouched.
    assert_eq!(amplifier.channel(4).await.unwrap(), ChannelConfig { channel: 4, ..before.clone() });
    assert_eq!(handle.count("setChannel"), 1);
}

#[tokio::test]
async fn test_set_then_get_is_idempotent() {
    for sim in [SimulatedAmplifier::new(), SimulatedAmplifier::new().with_plain_numbers()] {
        let (transport, _handle) = amplifier_transport(sim);
        let amplifier = Kh7008::new(&transport);

        let wanted = config(6);
        amplifier.set_channel(&wanted).await.unwrap();
        assert_eq!(amplifier.channel(6).await.unwrap(), wanted);

        // Applying the read-back again leaves the device unchanged.
        let read_back = amplifier.channel(6).await.unwrap();
        amplifier.set_channel(&read_back).await.unwrap();
        assert_eq!(amplifier.channel(6).await.unwrap(), wanted);
    }
}

#[tokio::test]
async fn test_set_all_channels_is_all_or_nothing_locally() {
    let (transport, handle) = amplifier_transport(SimulatedAmplifier::new());
    let amplifier = Kh7008::new(&transport);

    let mut configs: Vec<ChannelConfig> = (1..=8).map(config).collect();
    configs[5].gain = 20;

    match amplifier.set_all_channels(&configs).await {
        Err(FlexError::Validation(err)) => {
            assert_eq!(err.parameter, Parameter::Gain);
            assert_eq!(err.allowed, validator::allowed_values(Parameter::Gain));
        }
        other => panic!("expected Validation, got {other:?}"),
    }
    assert!(handle.call_log().is_empty());

    configs[5].gain = 10;
    amplifier.set_all_channels(&configs).await.unwrap();
    let all = amplifier.all_channels().await.unwrap();
    assert_eq!(all.len(), 8);
    assert_eq!(all[5].gain, 10);
    assert_eq!(all[7], config(8));
}

#[tokio::test]
async fn test_invalid_update_sends_no_set() {
    let (transport, handle) = amplifier_transport(SimulatedAmplifier::new());
    let amplifier = Kh7008::new(&transport);

    let result = amplifier
        .update_channel(2, &ChannelUpdate::new().input("SE"))
        .await;
    assert!(matches!(result, Err(FlexError::Validation(_))));
    assert_eq!(handle.count("setChannel"), 0);

    assert!(matches!(
        amplifier.channel(9).await,
        Err(FlexError::Validation(_))
    ));
    assert_eq!(handle.count("getChannel"), 1);
}

#[test]
fn test_allowed_value_tables_match_the_device() {
    let tables = Kh7008::allowed_values();
    assert_eq!(tables.len(), 6);
    assert!(tables
        .iter()
        .any(|(p, values)| *p == Parameter::Shunt && values.contains(&ParamValue::Int(10_000_000))));
}

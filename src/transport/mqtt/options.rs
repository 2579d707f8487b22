//! Pure MQTT option construction
//!
//! Builds rumqttc options from a broker's [`ConnectOptions`]. Kept free of I/O so
//! the mapping can be tested without a broker.

use crate::transport::ConnectOptions;
use rumqttc::v5::MqttOptions;
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest packet accepted from the broker
const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Build a unique client id for one connect attempt
///
/// A new id per attempt prevents the broker from kicking a half-closed session
/// that still holds the previous id.
pub fn build_client_id(options: &ConnectOptions) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("mqtt-pool-{}-{millis}", options.broker_id.simple())
}

/// Map connect options onto rumqttc options (pure function)
pub fn configure_mqtt_options(options: &ConnectOptions) -> MqttOptions {
    let mut mqtt_options =
        MqttOptions::new(build_client_id(options), options.host.clone(), options.port);

    if !options.credentials.login.is_empty() {
        mqtt_options.set_credentials(
            options.credentials.login.clone(),
            options.credentials.password.clone(),
        );
    }

    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_start(true);
    mqtt_options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    mqtt_options
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Credentials;
    use std::time::Duration;
    use uuid::Uuid;

    fn test_options() -> ConnectOptions {
        ConnectOptions {
            broker_id: Uuid::new_v4(),
            host: "broker.local".to_string(),
            port: 1884,
            credentials: Credentials::new("user", "pass"),
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_client_id_contains_broker_id() {
        let options = test_options();
        let client_id = build_client_id(&options);
        assert!(client_id.starts_with("mqtt-pool-"));
        assert!(client_id.contains(&options.broker_id.simple().to_string()));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = test_options();
        let mqtt_options = configure_mqtt_options(&options);

        assert_eq!(
            mqtt_options.broker_address(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(mqtt_options.keep_alive(), Duration::from_secs(30));
    }
}

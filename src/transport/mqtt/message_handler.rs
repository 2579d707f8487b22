//! Pure routing of rumqttc events and failure classification
//!
//! Everything here is side-effect free so the event-loop task in
//! [`super::client`] only has to act on the decisions made here.

use crate::transport::{ConnectFailure, FailureKind, TransportEvent};
use rumqttc::v5::mqttbytes::v5::{
    ConnectReturnCode, DisconnectReasonCode, Packet, SubscribeReasonCode, UnsubAckReason,
};
use rumqttc::v5::{ConnectionError, Event};
use rumqttc::Outgoing;

/// Pure routing decisions for rumqttc events
pub struct MessageHandler;

impl MessageHandler {
    /// Route an MQTT event to the action the transport takes (pure function)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                },
                Packet::Disconnect(disconnect) => EventRoute::Disconnected {
                    failure: Self::classify_broker_disconnect(disconnect.reason_code),
                },
                Packet::SubAck(suback) => EventRoute::SubscribeAcknowledged {
                    packet_id: suback.pkid,
                    outcome: Self::classify_suback(&suback.return_codes),
                },
                Packet::UnsubAck(unsuback) => EventRoute::UnsubscribeAcknowledged {
                    packet_id: unsuback.pkid,
                    outcome: Self::classify_unsuback(&unsuback.reasons),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Subscribe(packet_id)) => EventRoute::SubscribeSent {
                packet_id: *packet_id,
            },
            Event::Outgoing(Outgoing::Unsubscribe(packet_id)) => EventRoute::UnsubscribeSent {
                packet_id: *packet_id,
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Classify an event-loop error raised while connecting (pure function)
    pub fn classify_connection_error(error: &ConnectionError) -> ConnectFailure {
        match error {
            ConnectionError::ConnectionRefused(code) => match code {
                ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                    ConnectFailure::invalid_credentials(format!("Connection refused: {code:?}"))
                }
                other => ConnectFailure::other(format!("Connection refused: {other:?}")),
            },
            ConnectionError::Io(io_error) => ConnectFailure::socket(io_error.to_string()),
            other => ConnectFailure::other(other.to_string()),
        }
    }

    /// Classify a Disconnect packet sent by the broker (pure function)
    pub fn classify_broker_disconnect(code: DisconnectReasonCode) -> ConnectFailure {
        let message = format!("Broker disconnected: {code:?}");
        match code {
            DisconnectReasonCode::NotAuthorized => ConnectFailure::invalid_credentials(message),
            _ => ConnectFailure::other(message),
        }
    }

    /// Event reported when an established link is lost (pure function)
    ///
    /// A credentials rejection surfaces as `ConnectingFailed` so the owning
    /// connection stops retrying; everything else is a plain disconnect.
    pub fn link_lost_event(failure: ConnectFailure, requested: bool) -> TransportEvent {
        if !requested && failure.kind == FailureKind::InvalidCredentials {
            TransportEvent::ConnectingFailed(failure)
        } else {
            TransportEvent::Disconnected {
                requested,
                reason: failure.message,
            }
        }
    }

    /// Check SubAck reason codes; any non-success code fails the subscribe (pure function)
    pub fn classify_suback(codes: &[SubscribeReasonCode]) -> Result<(), String> {
        let rejected: Vec<_> = codes
            .iter()
            .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
            .collect();
        if rejected.is_empty() {
            Ok(())
        } else {
            Err(format!("Broker rejected subscription: {rejected:?}"))
        }
    }

    /// Check UnsubAck reasons (pure function)
    ///
    /// `NoSubscriptionExisted` leaves the topic unsubscribed, so it counts as success.
    pub fn classify_unsuback(reasons: &[UnsubAckReason]) -> Result<(), String> {
        let rejected: Vec<_> = reasons
            .iter()
            .filter(|reason| {
                !matches!(
                    reason,
                    UnsubAckReason::Success | UnsubAckReason::NoSubscriptionExisted
                )
            })
            .collect();
        if rejected.is_empty() {
            Ok(())
        } else {
            Err(format!("Broker rejected unsubscribe: {rejected:?}"))
        }
    }

    /// Decode a payload to text for dispatch (pure function)
    ///
    /// Dispatchers take UTF-8 text; invalid sequences are replaced rather than
    /// dropping the message.
    pub fn decode_payload(payload: &[u8]) -> String {
        String::from_utf8_lossy(payload).into_owned()
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// ConnAck received - the link is up
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived {
        topic: String,
        payload: bytes::Bytes,
    },
    /// Broker sent a Disconnect packet
    Disconnected { failure: ConnectFailure },
    /// Subscribe packet left with this packet id
    SubscribeSent { packet_id: u16 },
    /// Unsubscribe packet left with this packet id
    UnsubscribeSent { packet_id: u16 },
    /// SubAck received with its classified reason codes
    SubscribeAcknowledged {
        packet_id: u16,
        outcome: Result<(), String>,
    },
    /// UnsubAck received with its classified reasons
    UnsubscribeAcknowledged {
        packet_id: u16,
        outcome: Result<(), String>,
    },
    /// Infrastructure event (PingResp, PubAck...)
    InfrastructureEvent(String),
    /// Other outgoing event (handled by rumqttc)
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{ConnAck, Disconnect, Publish, SubAck, UnsubAck};
    use rumqttc::v5::mqttbytes::QoS;
    use std::io;

    #[test]
    fn test_route_connack() {
        let connack = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&connack),
            EventRoute::ConnectionAcknowledged
        );
    }

    #[test]
    fn test_route_disconnect() {
        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::ServerShuttingDown,
            properties: None,
        }));

        match MessageHandler::route_mqtt_event(&disconnect) {
            EventRoute::Disconnected { failure } => {
                assert_eq!(failure.kind, FailureKind::Other);
                assert!(failure.message.contains("ServerShuttingDown"));
            }
            other => panic!("Expected Disconnected route, got {other:?}"),
        }
    }

    #[test]
    fn test_route_publish() {
        let publish = Event::Incoming(Packet::Publish(Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("sensors/kitchen"),
            pkid: 1,
            payload: Bytes::from("21.5"),
            properties: None,
        }));

        assert_eq!(
            MessageHandler::route_mqtt_event(&publish),
            EventRoute::MessageReceived {
                topic: "sensors/kitchen".to_string(),
                payload: Bytes::from("21.5"),
            }
        );
    }

    #[test]
    fn test_route_ping_is_infrastructure() {
        let ping = Event::Incoming(Packet::PingResp(rumqttc::v5::mqttbytes::v5::PingResp));
        assert!(matches!(
            MessageHandler::route_mqtt_event(&ping),
            EventRoute::InfrastructureEvent(_)
        ));
    }

    #[test]
    fn test_route_not_authorized_disconnect() {
        let disconnect = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NotAuthorized,
            properties: None,
        }));

        match MessageHandler::route_mqtt_event(&disconnect) {
            EventRoute::Disconnected { failure } => {
                assert_eq!(failure.kind, FailureKind::InvalidCredentials);
            }
            other => panic!("Expected Disconnected route, got {other:?}"),
        }
    }

    #[test]
    fn test_link_lost_event() {
        assert_eq!(
            MessageHandler::link_lost_event(ConnectFailure::invalid_credentials("revoked"), false),
            TransportEvent::ConnectingFailed(ConnectFailure::invalid_credentials("revoked"))
        );
        assert_eq!(
            MessageHandler::link_lost_event(ConnectFailure::socket("reset"), false),
            TransportEvent::Disconnected {
                requested: false,
                reason: "reset".to_string(),
            }
        );
        // Our own disconnect is never reported as a rejection
        assert!(matches!(
            MessageHandler::link_lost_event(ConnectFailure::invalid_credentials("x"), true),
            TransportEvent::Disconnected { requested: true, .. }
        ));
    }

    #[test]
    fn test_route_outgoing_subscribe_carries_packet_id() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Subscribe(7))),
            EventRoute::SubscribeSent { packet_id: 7 }
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Unsubscribe(8))),
            EventRoute::UnsubscribeSent { packet_id: 8 }
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::OutgoingEvent
        );
    }

    #[test]
    fn test_route_suback_rejection() {
        let suback = Event::Incoming(Packet::SubAck(SubAck {
            pkid: 3,
            return_codes: vec![SubscribeReasonCode::NotAuthorized],
            properties: None,
        }));

        match MessageHandler::route_mqtt_event(&suback) {
            EventRoute::SubscribeAcknowledged { packet_id, outcome } => {
                assert_eq!(packet_id, 3);
                assert!(outcome.unwrap_err().contains("NotAuthorized"));
            }
            other => panic!("Expected SubscribeAcknowledged route, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_suback_codes() {
        assert_eq!(
            MessageHandler::classify_suback(&[SubscribeReasonCode::Success(QoS::AtLeastOnce)]),
            Ok(())
        );
        // Broker may downgrade the QoS; still a subscription
        assert_eq!(
            MessageHandler::classify_suback(&[SubscribeReasonCode::Success(QoS::AtMostOnce)]),
            Ok(())
        );
        for code in [
            SubscribeReasonCode::Failure,
            SubscribeReasonCode::NotAuthorized,
            SubscribeReasonCode::TopicFilterInvalid,
            SubscribeReasonCode::QuotaExceeded,
        ] {
            assert!(MessageHandler::classify_suback(&[code]).is_err());
        }
    }

    #[test]
    fn test_route_unsuback() {
        let unsuback = Event::Incoming(Packet::UnsubAck(UnsubAck {
            pkid: 4,
            reasons: vec![UnsubAckReason::NoSubscriptionExisted],
            properties: None,
        }));

        assert_eq!(
            MessageHandler::route_mqtt_event(&unsuback),
            EventRoute::UnsubscribeAcknowledged {
                packet_id: 4,
                outcome: Ok(()),
            }
        );
        assert!(MessageHandler::classify_unsuback(&[UnsubAckReason::NotAuthorized]).is_err());
    }

    #[test]
    fn test_classify_bad_credentials() {
        for code in [
            ConnectReturnCode::BadUserNamePassword,
            ConnectReturnCode::NotAuthorized,
        ] {
            let failure =
                MessageHandler::classify_connection_error(&ConnectionError::ConnectionRefused(code));
            assert_eq!(failure.kind, crate::transport::FailureKind::InvalidCredentials);
        }
    }

    #[test]
    fn test_classify_other_refusal() {
        let failure = MessageHandler::classify_connection_error(
            &ConnectionError::ConnectionRefused(ConnectReturnCode::ServerUnavailable),
        );
        assert_eq!(failure.kind, crate::transport::FailureKind::Other);
    }

    #[test]
    fn test_classify_io_error() {
        let error = ConnectionError::Io(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        let failure = MessageHandler::classify_connection_error(&error);
        assert_eq!(failure.kind, crate::transport::FailureKind::SocketError);
        assert!(failure.message.contains("refused"));
    }

    #[test]
    fn test_classify_requests_done() {
        let failure = MessageHandler::classify_connection_error(&ConnectionError::RequestsDone);
        assert_eq!(failure.kind, crate::transport::FailureKind::Other);
    }

    #[test]
    fn test_decode_payload() {
        assert_eq!(MessageHandler::decode_payload(b"{\"t\":1}"), "{\"t\":1}");
        assert_eq!(MessageHandler::decode_payload(&[0x66, 0xff, 0x6f]), "f\u{fffd}o");
    }
}

use mqtt_explorer::error::SessionError;
use mqtt_explorer::models::SessionState;
use mqtt_explorer::session_manager::ListenOutcome;
use rumqttc::QoS;
use std::sync::atomic::Ordering;
use tokio::time::{sleep, Duration};

mod helpers;
use helpers::{eventually, setup};

#[cfg(test)]
mod session_tests {
    use super::*;

    // =========================================================================================
    // 1. REGISTRATION
    // =========================================================================================

    mod registration {
        use super::*;

        #[tokio::test]
        async fn test_duplicate_name_is_rejected() {
            let h = setup();
            h.sessions.register_config("Home", "127.0.0.1", 1883).await.unwrap();

            let err = h
                .sessions
                .register_config("Home", "10.0.0.1", 1884)
                .await
                .unwrap_err();
            assert!(matches!(err, SessionError::DuplicateName(name) if name == "Home"));

            let config = h.sessions.config("Home").await.unwrap();
            assert_eq!(config.host, "127.0.0.1", "First registration must win");
        }

        #[tokio::test]
        async fn test_remove_broker_forgets_everything() {
            let h = setup();
            h.sessions.register_config("Home", "127.0.0.1", 1883).await.unwrap();
            h.sessions.connect("Home").await.unwrap();
            h.pipeline.ingest("Home", "a/b", "1").await;

            h.sessions.remove_broker("Home").await.unwrap();

            assert!(h.sessions.config("Home").await.is_none());
            assert!(h.sessions.state("Home").await.is_none());
            assert_eq!(h.sessions.lookup("Home", "a/b").await, None);
            assert!(h.connector.connection("Home").client.disconnected.load(Ordering::SeqCst));
            assert!(matches!(
                h.sessions.remove_broker("Home").await,
                Err(SessionError::UnknownBroker(_))
            ));
        }

        #[tokio::test]
        async fn test_queued_message_does_not_revive_removed_broker() {
            let h = setup();
            h.sessions.register_config("Home", "127.0.0.1", 1883).await.unwrap();
            h.sessions.connect("Home").await.unwrap();

            h.sessions.on_message("Home", "a/b", b"1", QoS::AtMostOnce, false);
            h.sessions.remove_broker("Home").await.unwrap();
            sleep(Duration::from_millis(100)).await;

            assert!(h.sessions.config("Home").await.is_none());
            assert_eq!(h.sessions.lookup("Home", "a/b").await, None);
            assert_eq!(h.sessions.topic_count("Home").await, 0);
        }
    }

    // =========================================================================================
    // 2. CONNECT LIFECYCLE
    // =========================================================================================

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_connect_unknown_broker() {
            let h = setup();
            let err = h.sessions.connect("Nowhere").await.unwrap_err();
            assert!(matches!(err, SessionError::UnknownBroker(_)));
            assert!(h.sessions.state("Nowhere").await.is_none());
        }

        #[tokio::test]
        async fn test_connect_subscribes_to_wildcard() {
            let h = setup();
            h.sessions.register_config("Home", "127.0.0.1", 1883).await.unwrap();

            h.sessions.connect("Home").await.unwrap();

            assert_eq!(h.sessions.state("Home").await, Some(SessionState::Connected));
            let connection = h.connector.connection("Home");
            assert_eq!(*connection.client.subscriptions.lock().unwrap(), vec!["#".to_string()]);
            assert!(connection.client_id.starts_with("mqtt-explorer-Home-"));
        }

        #[tokio::test]
        async fn test_connect_twice_while_connected() {
            let h = setup();
            h.sessions.register_config("Home", "127.0.0.1", 1883).await.unwrap();
            h.sessions.connect("Home").await.unwrap();

            let err = h.sessions.connect("Home").await.unwrap_err();
            assert!(matches!(err, SessionError::AlreadyConnected(_)));
            assert_eq!(h.connector.connect_count("Home"), 1);
            assert_eq!(h.sessions.state("Home").await, Some(SessionState::Connected));
        }

        #[tokio::test]
        async fn test_connect_twice_while_connecting() {
            let h = setup();
            h.sessions.register_config("Home", "127.0.0.1", 1883).await.unwrap();
            h.connector.hold_connects();

            let first = {
                let sessions = h.sessions.clone();
                tokio::spawn(async move { sessions.connect("Home").await })
            };
            let sessions = &h.sessions;
            assert!(
                eventually(|| async move {
                    sessions.state("Home").await == Some(SessionState::Connecting)
                })
                .await
            );

            let err = h.sessions.connect("Home").await.unwrap_err();
            assert!(matches!(err, SessionError::AlreadyConnected(_)));

            h.connector.release();
            first.await.unwrap().unwrap();
            assert_eq!(h.connector.connect_count("Home"), 1);
            assert_eq!(h.sessions.state("Home").await, Some(SessionState::Connected));
        }

        #[tokio::test]
        async fn test_unreachable_broker_fails_without_affecting_others() {
            let h = setup();
            h.connector.set_unreachable("10.255.255.1");
            h.sessions.register_config("Dead", "10.255.255.1", 1883).await.unwrap();
            h.sessions.register_config("Home", "127.0.0.1", 1883).await.unwrap();

            let err = h.sessions.connect("Dead").await.unwrap_err();
            assert!(matches!(err, SessionError::ConnectionFailed { ref broker, .. } if broker == "Dead"));
            assert!(matches!(
                h.sessions.state("Dead").await,
                Some(SessionState::Failed(_))
            ));

            // Failed is left by an explicit new attempt
            assert!(matches!(
                h.sessions.connect("Dead").await,
                Err(SessionError::ConnectionFailed { .. })
            ));

            h.sessions.connect("Home").await.unwrap();
            assert_eq!(h.sessions.state("Home").await, Some(SessionState::Connected));
        }

        #[tokio::test]
        async fn test_disconnect_during_handshake_wins() {
            let h = setup();
            h.sessions.register_config("Home", "127.0.0.1", 1883).await.unwrap();
            h.connector.hold_connects();

            let pending = {
                let sessions = h.sessions.clone();
                tokio::spawn(async move { sessions.connect("Home").await })
            };
            let sessions = &h.sessions;
            assert!(
                eventually(|| async move {
                    sessions.state("Home").await == Some(SessionState::Connecting)
                })
                .await
            );

            h.sessions.disconnect("Home").await.unwrap();
            h.connector.release();

            assert!(matches!(
                pending.await.unwrap(),
                Err(SessionError::ConnectionFailed { .. })
            ));
            assert_eq!(h.sessions.state("Home").await, Some(SessionState::Disconnected));
            assert!(h.connector.connection("Home").client.disconnected.load(Ordering::SeqCst));
        }

        #[tokio::test]
        async fn test_disconnect_of_registered_but_idle_broker() {
            let h = setup();
            h.sessions.register_config("Home", "127.0.0.1", 1883).await.unwrap();

            assert!(matches!(
                h.sessions.disconnect("Home").await,
                Err(SessionError::BrokerNotConnected(_))
            ));
            assert!(matches!(
                h.sessions.disconnect("Other").await,
                Err(SessionError::UnknownBroker(_))
            ));
        }
    }

    // =========================================================================================
    // 3. RECEIVE LOOPS
    // =========================================================================================

    mod listen {
        use super::*;

        #[tokio::test]
        async fn test_connection_loss_ends_loop() {
            let h = setup();
            h.sessions.register_config("Home", "127.0.0.1", 1883).await.unwrap();
            h.sessions.connect("Home").await.unwrap();

            let listener = {
                let sessions = h.sessions.clone();
                tokio::spawn(async move { sessions.listen("Home").await })
            };
            h.connector.connection("Home").drop_connection("keep alive timeout");

            let outcome = listener.await.unwrap().unwrap();
            assert_eq!(
                outcome,
                ListenOutcome::ConnectionLost(Some("keep alive timeout".to_string()))
            );
            assert_eq!(h.sessions.state("Home").await, Some(SessionState::Disconnected));
            assert!(matches!(
                h.sessions.publisher("Home").await,
                Err(SessionError::BrokerNotConnected(_))
            ));
        }

        #[tokio::test]
        async fn test_disconnect_cancels_only_its_own_loop() {
            let h = setup();
            for (name, host) in [("Home", "127.0.0.1"), ("Office", "10.0.0.2")] {
                h.sessions.register_config(name, host, 1883).await.unwrap();
                h.sessions.connect(name).await.unwrap();
            }

            let home = {
                let sessions = h.sessions.clone();
                tokio::spawn(async move { sessions.listen("Home").await })
            };
            let office = {
                let sessions = h.sessions.clone();
                tokio::spawn(async move { sessions.listen("Office").await })
            };

            h.sessions.disconnect("Home").await.unwrap();
            assert_eq!(home.await.unwrap().unwrap(), ListenOutcome::Cancelled);

            h.connector.connection("Office").publish("desk/lamp", b"on");
            let sessions = &h.sessions;
            assert!(
                eventually(|| async move {
                    sessions.lookup("Office", "desk/lamp").await.as_deref() == Some("on")
                })
                .await
            );
            assert!(!office.is_finished());
            assert_eq!(h.sessions.state("Office").await, Some(SessionState::Connected));
        }

        #[tokio::test]
        async fn test_listen_requires_connected_session() {
            let h = setup();
            h.sessions.register_config("Home", "127.0.0.1", 1883).await.unwrap();

            assert!(matches!(
                h.sessions.listen("Nowhere").await,
                Err(SessionError::UnknownBroker(_))
            ));

            h.sessions.connect("Home").await.unwrap();
            h.sessions.disconnect("Home").await.unwrap();
            assert!(matches!(
                h.sessions.listen("Home").await,
                Err(SessionError::BrokerNotConnected(_))
            ));
        }

        #[tokio::test]
        async fn test_undecodable_payload_is_replaced() {
            let h = setup();
            h.sessions.register_config("Home", "127.0.0.1", 1883).await.unwrap();
            h.sessions.connect("Home").await.unwrap();
            let listener = h.sessions.clone();
            tokio::spawn(async move { listener.listen("Home").await });

            h.connector.connection("Home").publish("raw/bytes", &[0x66, 0x6f, 0xff, 0x6f]);

            let sessions = &h.sessions;
            assert!(
                eventually(|| async move {
                    sessions.lookup("Home", "raw/bytes").await.as_deref() == Some("fo\u{FFFD}o")
                })
                .await
            );
        }

        #[tokio::test]
        async fn test_collaborator_reconnect_resubscribes() {
            let h = setup();
            h.sessions.register_config("Home", "127.0.0.1", 1883).await.unwrap();
            h.sessions.connect("Home").await.unwrap();

            h.sessions.on_disconnect("Home").await;
            assert_eq!(h.sessions.state("Home").await, Some(SessionState::Disconnected));

            h.sessions.on_connect("Home").await;
            assert_eq!(h.sessions.state("Home").await, Some(SessionState::Connected));
            assert_eq!(
                h.connector.connection("Home").client.subscriptions.lock().unwrap().len(),
                2
            );
        }

        #[tokio::test]
        async fn test_connect_notification_does_not_revive_failed_session() {
            let h = setup();
            h.connector.set_unreachable("10.255.255.1");
            h.sessions.register_config("Dead", "10.255.255.1", 1883).await.unwrap();
            h.sessions.connect("Dead").await.unwrap_err();

            h.sessions.on_connect("Dead").await;
            assert!(matches!(
                h.sessions.state("Dead").await,
                Some(SessionState::Failed(_))
            ));

            h.sessions.on_disconnect("Dead").await;
            assert!(matches!(
                h.sessions.state("Dead").await,
                Some(SessionState::Failed(_))
            ));
        }

        #[tokio::test]
        async fn test_connect_notification_ignored_after_operator_disconnect() {
            let h = setup();
            h.sessions.register_config("Home", "127.0.0.1", 1883).await.unwrap();
            h.sessions.connect("Home").await.unwrap();
            h.sessions.disconnect("Home").await.unwrap();

            h.sessions.on_connect("Home").await;
            assert_eq!(h.sessions.state("Home").await, Some(SessionState::Disconnected));
            assert!(h.sessions.publisher("Home").await.is_err());
        }

        #[tokio::test]
        async fn test_disconnect_notification_leaves_handshake_alone() {
            let h = setup();
            h.sessions.register_config("Home", "127.0.0.1", 1883).await.unwrap();
            h.connector.hold_connects();

            let pending = {
                let sessions = h.sessions.clone();
                tokio::spawn(async move { sessions.connect("Home").await })
            };
            let sessions = &h.sessions;
            assert!(
                eventually(|| async move {
                    sessions.state("Home").await == Some(SessionState::Connecting)
                })
                .await
            );

            h.sessions.on_disconnect("Home").await;
            assert_eq!(h.sessions.state("Home").await, Some(SessionState::Connecting));

            h.connector.release();
            pending.await.unwrap().unwrap();
            assert_eq!(h.sessions.state("Home").await, Some(SessionState::Connected));
        }
    }
}

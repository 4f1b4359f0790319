use tracing::debug;

use crate::api_contract::relay::{Envelope, MessageFamily, ServerMessage, error_codes};
use crate::models::{Principal, Role};
use crate::services::relay_hub::{ConnectionId, HubError, RelayHub};

/// Route one inbound text frame.
///
/// Returns the reply owed to the sender, if any. Forwarded frames are only
/// queued here, never awaited.
pub fn route(hub: &RelayHub, sender: ConnectionId, principal: &Principal, text: &str) -> Option<ServerMessage> {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            debug!(connection_id = %sender, error = %err, "inbound_frame_rejected");
            return Some(ServerMessage::invalid(&err, Envelope::peek_id(text)));
        }
    };

    match (principal.role, envelope.family()) {
        (Role::Mobile, MessageFamily::Command | MessageFamily::Directive) => match hub
            .forward_to_desktop(&sender, &envelope)
        {
            Ok(()) => None,
            Err(HubError::DesktopOffline) => Some(ServerMessage::error(
                error_codes::DESKTOP_OFFLINE,
                "desktop is not connected",
                envelope.id,
            )),
            Err(HubError::DesktopBusy) => Some(ServerMessage::error(
                error_codes::DESKTOP_BUSY,
                "desktop is not keeping up, try again",
                envelope.id,
            )),
            Err(err) => {
                debug!(connection_id = %sender, error = %err, "command_not_forwarded");
                None
            }
        },
        (Role::Desktop, MessageFamily::Response | MessageFamily::Event) => {
            if let Err(err) = hub.forward_to_mobiles(&sender, &envelope) {
                debug!(connection_id = %sender, error = %err, "desktop_message_not_forwarded");
            }
            None
        }
        (role, _) => Some(ServerMessage::error(
            error_codes::INVALID_MESSAGE,
            format!("{} connections may not send `{}`", role, envelope.kind),
            envelope.id,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OverflowPolicy, RelayConfig};
    use crate::services::relay_hub::tests::{TestConn, hub_with, settle};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn code_of(reply: Option<ServerMessage>) -> Option<(String, Option<String>)> {
        match reply {
            Some(ServerMessage::Error { code, id, .. }) => Some((code, id)),
            _ => None,
        }
    }

    #[actix_rt::test]
    async fn test_mobile_command_without_desktop() {
        let hub = hub_with(RelayConfig::default());
        let mobile = TestConn::new(Principal::mobile(Uuid::new_v4()), 16);
        hub.register(mobile.handle.clone()).unwrap();

        let reply = route(&hub, mobile.id(), &mobile.handle.principal, r#"{"type":"list_jobs","id":"1"}"#);
        assert_eq!(
            code_of(reply),
            Some((error_codes::DESKTOP_OFFLINE.to_string(), Some("1".to_string())))
        );
    }

    #[actix_rt::test]
    async fn test_direction_violations_are_invalid() {
        let hub = hub_with(RelayConfig::default());
        let account = Uuid::new_v4();
        let desk = TestConn::new(Principal::desktop(account, Uuid::new_v4(), "d"), 16);
        let mobile = TestConn::new(Principal::mobile(account), 16);
        hub.register(desk.handle.clone()).unwrap();
        hub.register(mobile.handle.clone()).unwrap();

        let cases = [
            (&mobile, r#"{"type":"jobs_list","id":"a"}"#, Some("a")),
            (&mobile, r#"{"type":"status_update","name":"x","status":"y"}"#, None),
            (&mobile, r#"{"type":"welcome","connection_id":"x"}"#, None),
            (&desk, r#"{"type":"run_job","id":"b","name":"x"}"#, Some("b")),
            (&desk, r#"{"type":"desktop_status","online":true}"#, None),
        ];
        for (conn, frame, id) in cases {
            assert_eq!(
                code_of(route(&hub, conn.id(), &conn.handle.principal, frame)),
                Some((error_codes::INVALID_MESSAGE.to_string(), id.map(str::to_string))),
                "frame {}",
                frame
            );
        }
    }

    #[actix_rt::test]
    async fn test_malformed_frames_echo_id_when_possible() {
        let hub = hub_with(RelayConfig::default());
        let mobile = TestConn::new(Principal::mobile(Uuid::new_v4()), 16);
        hub.register(mobile.handle.clone()).unwrap();
        let principal = mobile.handle.principal.clone();

        assert_eq!(
            code_of(route(&hub, mobile.id(), &principal, "not json")),
            Some((error_codes::INVALID_MESSAGE.to_string(), None))
        );
        assert_eq!(
            code_of(route(&hub, mobile.id(), &principal, r#"{"type":"warp","id":"w"}"#)),
            Some((error_codes::INVALID_MESSAGE.to_string(), Some("w".to_string())))
        );
        assert_eq!(
            code_of(route(&hub, mobile.id(), &principal, r#"{"type":"run_job","name":"x"}"#)),
            Some((error_codes::INVALID_MESSAGE.to_string(), None))
        );
    }

    #[actix_rt::test]
    async fn test_job_runner_catalogue_is_forwarded() {
        let hub = hub_with(RelayConfig::default());
        let account = Uuid::new_v4();
        let desk = TestConn::new(Principal::desktop(account, Uuid::new_v4(), "d"), 64);
        let mobile = TestConn::new(Principal::mobile(account), 64);
        hub.register(mobile.handle.clone()).unwrap();
        hub.register(desk.handle.clone()).unwrap();

        let from_mobile = [
            r#"{"type":"unsubscribe_logs","name":"backup"}"#,
            r#"{"type":"get_detected_process_logs","id":"m1","tmux_session":"s","pane_id":"%1"}"#,
            r#"{"type":"send_detected_process_input","id":"m2","pane_id":"%1","text":"y"}"#,
            r#"{"type":"stop_detected_process","id":"m3","pane_id":"%1"}"#,
            r#"{"type":"answer_question","id":"m4","question_id":"q","pane_id":"%1","answer":"yes"}"#,
            r#"{"type":"set_auto_yes_panes","id":"m5","pane_ids":["%1"]}"#,
        ];
        let from_desktop = [
            r#"{"type":"detected_process_logs","id":"m1","logs":"..."}"#,
            r#"{"type":"send_detected_process_input_ack","id":"m2","success":true}"#,
            r#"{"type":"stop_detected_process_ack","id":"m3","success":true}"#,
            r#"{"type":"claude_questions","questions":[]}"#,
        ];

        for frame in from_mobile {
            assert_eq!(route(&hub, mobile.id(), &mobile.handle.principal, frame), None, "frame {}", frame);
        }
        for frame in from_desktop {
            assert_eq!(route(&hub, desk.id(), &desk.handle.principal, frame), None, "frame {}", frame);
        }
        settle().await;

        let desk_frames = desk.raw_texts();
        assert_eq!(&desk_frames[desk_frames.len() - from_mobile.len()..], &from_mobile[..]);
        let mobile_frames = mobile.raw_texts();
        assert_eq!(&mobile_frames[mobile_frames.len() - from_desktop.len()..], &from_desktop[..]);
    }

    #[actix_rt::test]
    async fn test_directive_without_desktop_is_offline() {
        let hub = hub_with(RelayConfig::default());
        let mobile = TestConn::new(Principal::mobile(Uuid::new_v4()), 16);
        hub.register(mobile.handle.clone()).unwrap();

        let reply = route(&hub, mobile.id(), &mobile.handle.principal, r#"{"type":"unsubscribe_logs","name":"x"}"#);
        assert_eq!(code_of(reply), Some((error_codes::DESKTOP_OFFLINE.to_string(), None)));
    }

    #[actix_rt::test]
    async fn test_full_desktop_queue_is_reported_to_sender() {
        let hub = hub_with(RelayConfig {
            overflow_policy: OverflowPolicy::DropNewest,
            ..RelayConfig::default()
        });
        let account = Uuid::new_v4();
        // welcome holds one of the two slots until the actor runs
        let desk = TestConn::new(Principal::desktop(account, Uuid::new_v4(), "d"), 2);
        let mobile = TestConn::new(Principal::mobile(account), 16);
        hub.register(mobile.handle.clone()).unwrap();
        hub.register(desk.handle.clone()).unwrap();

        let replies: Vec<_> = ["1", "2", "3"]
            .iter()
            .map(|id| {
                let frame = format!(r#"{{"type":"list_jobs","id":"{}"}}"#, id);
                code_of(route(&hub, mobile.id(), &mobile.handle.principal, &frame))
            })
            .collect();
        assert_eq!(
            replies,
            vec![
                None,
                Some((error_codes::DESKTOP_BUSY.to_string(), Some("2".to_string()))),
                Some((error_codes::DESKTOP_BUSY.to_string(), Some("3".to_string()))),
            ]
        );
        assert!(hub.has_desktop(&account));
    }

    #[actix_rt::test]
    async fn test_closed_desktop_is_reported_offline() {
        let hub = hub_with(RelayConfig::default());
        let account = Uuid::new_v4();
        let desk = TestConn::new(Principal::desktop(account, Uuid::new_v4(), "d"), 16);
        let mobile = TestConn::new(Principal::mobile(account), 16);
        hub.register(mobile.handle.clone()).unwrap();
        hub.register(desk.handle.clone()).unwrap();

        desk.handle.queue.push_close("gone");
        settle().await;

        let reply = route(&hub, mobile.id(), &mobile.handle.principal, r#"{"type":"run_job","id":"r9","name":"x"}"#);
        assert_eq!(
            code_of(reply),
            Some((error_codes::DESKTOP_OFFLINE.to_string(), Some("r9".to_string())))
        );
    }

    #[actix_rt::test]
    async fn test_events_keep_order() {
        let hub = hub_with(RelayConfig::default());
        let account = Uuid::new_v4();
        let desk = TestConn::new(Principal::desktop(account, Uuid::new_v4(), "d"), 16);
        let mobile = TestConn::new(Principal::mobile(account), 16);
        hub.register(mobile.handle.clone()).unwrap();
        hub.register(desk.handle.clone()).unwrap();

        let status = r#"{"type":"status_update","name":"backup","status":"running"}"#;
        let chunk = r#"{"type":"log_chunk","name":"backup","content":"line 1","timestamp":"t"}"#;
        assert!(route(&hub, desk.id(), &desk.handle.principal, status).is_none());
        assert!(route(&hub, desk.id(), &desk.handle.principal, chunk).is_none());
        settle().await;

        let frames = mobile.raw_texts();
        let tail: Vec<&str> = frames.iter().rev().take(2).rev().map(String::as_str).collect();
        assert_eq!(tail, vec![status, chunk]);
    }
}

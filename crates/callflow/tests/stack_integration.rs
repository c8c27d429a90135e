//! Full-stack wiring: engine flow events land in the recorder, and the
//! query surface sees the result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use callflow::prelude::*;
use callflow::status::StatusStore;

struct QuietPbx;

#[async_trait]
impl TelephonyClient for QuietPbx {
    async fn play(
        &self,
        _channel: &ChannelId,
        _media: &str,
    ) -> Result<String, callflow::ivr::OperationError> {
        Ok("pb-0".to_string())
    }

    async fn stop_playback(&self, _playback_id: &str) -> Result<(), callflow::ivr::OperationError> {
        Ok(())
    }

    async fn originate(
        &self,
        _endpoint: &str,
        _caller_id: &str,
    ) -> Result<ChannelId, callflow::ivr::OperationError> {
        Ok(ChannelId::new("leg-1"))
    }

    async fn answer(&self, _channel: &ChannelId) -> Result<(), callflow::ivr::OperationError> {
        Ok(())
    }

    async fn hangup(&self, _channel: &ChannelId) -> Result<(), callflow::ivr::OperationError> {
        Ok(())
    }

    async fn redirect_to_extension(
        &self,
        _channel: &ChannelId,
        _extension: &str,
        _context: &str,
    ) -> Result<u16, callflow::ivr::OperationError> {
        Ok(200)
    }

    async fn channel_state(
        &self,
        _channel: &ChannelId,
    ) -> Result<ChannelState, callflow::ivr::OperationError> {
        Ok(ChannelState::Up)
    }
}

fn tree() -> NodeTree {
    let mut tree = NodeTree::new();
    tree.insert(
        IvrNode::new("root", "root", NodeAction::Menu).with_payload("welcome"),
    )
    .unwrap();
    tree.insert(
        IvrNode::new("bye", "Goodbye", NodeAction::Hangup)
            .with_parent("root")
            .with_digit('9'),
    )
    .unwrap();
    tree.register_root("root", "root");
    tree
}

#[tokio::test]
async fn engine_milestones_reach_the_recorder_and_query_surface() {
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let recorder = Arc::new(CallFlowRecorder::new(store.clone()));
    let query = QueryService::new(StatusStore::new(store.clone()), recorder.clone());

    let engine = IvrEngine::builder()
        .with_config(IvrConfig::default().with_fast_timing())
        .with_tree(tree())
        .with_telephony(Arc::new(QuietPbx))
        .with_flow_sink(recorder.clone())
        .with_store(store)
        .build()
        .unwrap();
    let bus = EventBus::new_default();
    engine.start(&bus).await.unwrap();

    bus.publish(TelephonyEvent::CallStart {
        call_id: CallId::new("c1"),
        channel_id: ChannelId::new("ch-1"),
        entry_key: None,
        caller: Some("5550100".to_string()),
    });
    bus.publish(TelephonyEvent::PlaybackStarted {
        call_id: CallId::new("c1"),
        playback_id: "pb-0".to_string(),
    });
    bus.publish(TelephonyEvent::PlaybackFinished {
        call_id: CallId::new("c1"),
        playback_id: "pb-0".to_string(),
    });
    tokio::time::sleep(Duration::from_millis(40)).await;

    // The root execution landed in the flow log and the meta summary,
    // and the call shows as active.
    let log = query.call_log("c1").await.unwrap();
    assert!(log.iter().any(|e| e.event == "NODE_EXECUTE"));
    let meta = query.call_meta("c1").await.unwrap().unwrap();
    assert_eq!(meta.ivr_visits.len(), 1);
    assert_eq!(meta.ivr_visits[0].name, "root");
    assert!(recorder
        .active_calls()
        .await
        .unwrap()
        .contains(&"c1".to_string()));

    // Caller hangs up through the menu.
    bus.publish(TelephonyEvent::Dtmf {
        call_id: CallId::new("c1"),
        digit: '9',
    });
    tokio::time::sleep(Duration::from_millis(40)).await;

    assert_eq!(engine.active_call_count(), 0);
    assert!(recorder.active_calls().await.unwrap().is_empty());
    let meta = query.call_meta("c1").await.unwrap().unwrap();
    assert!(meta.ended_at.is_some());
    // The open root visit got closed with a duration on call end.
    assert!(meta.ivr_visits.iter().all(|v| v.exited_at.is_some()));
}

//! # callflow
//!
//! Umbrella crate for the contact-center call-flow stack.
//!
//! - [`infra`]: event bus, shared TTL'd key-value store, retry helpers,
//!   logging setup.
//! - [`ivr`]: the IVR navigation engine, an event-driven state machine
//!   per call over a PBX control protocol.
//! - [`status`]: management-event reconciliation into operator, channel,
//!   and queue aggregates, plus the per-call flow recorder.
//!
//! ```no_run
//! use std::sync::Arc;
//! use callflow::prelude::*;
//!
//! # async fn example(telephony: Arc<dyn TelephonyClient>) -> anyhow::Result<()> {
//! let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
//! let recorder = Arc::new(CallFlowRecorder::new(store.clone()));
//!
//! let mut tree = NodeTree::new();
//! tree.insert(IvrNode::new("root", "root", NodeAction::Menu).with_payload("welcome"))?;
//!
//! let engine = IvrEngine::builder()
//!     .with_tree(tree)
//!     .with_telephony(telephony)
//!     .with_store(store)
//!     .with_flow_sink(recorder)
//!     .build()?;
//!
//! let bus = EventBus::new_default();
//! engine.start(&bus).await?;
//! # Ok(())
//! # }
//! ```

pub use callflow_infra as infra;
pub use callflow_ivr as ivr;
pub use callflow_status as status;

/// The commonly used types in one import.
pub mod prelude {
    pub use callflow_infra::{
        CachedKvStore, EventBus, InfraError, KvStore, LoggingConfig, MemoryKvStore,
    };
    pub use callflow_ivr::{
        ActiveCallState, CallId, ChannelId, ChannelState, FlowSink, IvrConfig, IvrEngine,
        IvrError, IvrNode, MediaResolver, NodeAction, NodeId, NodeTree, TelephonyClient,
        TelephonyEvent,
    };
    pub use callflow_status::{
        CallFlowRecorder, CallMeta, ManagementEvent, ManagementSession, OperatorState,
        OperatorStatus, QueryService, QueueStatus, RosterProvider, StatusError,
        StatusReconciler, StatusStore,
    };
}

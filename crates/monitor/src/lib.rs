//! Block-watch relay core: event source adapters, the normalization
//! pipeline, monitor sessions and the registry transports talk to.

pub mod channel;
pub mod hub;
pub mod pipeline;
pub mod rpc;
pub mod session;
pub mod source;

pub use channel::{
    ChannelError, ControlCallback, ControlSignal, ControlSignals, MemoryChannel, OutboundChannel,
    RemoteEnd,
};
pub use hub::{SessionHandle, WatchHub};
pub use pipeline::{normalize, NormalizeError};
pub use rpc::EthJsonRpcClient;
pub use session::MonitorSession;
pub use source::{
    EventSource, PollEventSource, PushEventSource, SequenceGate, SourceControl, SourceEvent,
    SourceHandle, StopOutcome,
};

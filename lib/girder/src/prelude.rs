pub use crate::asyncop::{
    AsyncHandle, AsyncOperationTable, AsyncRequestContext, CompletedOperation, OperationKind,
};
pub use crate::batch::{BatchCoalescer, BatchConfig};
pub use crate::gds::{ApplyOutcome, GdsConfig, GdsManager, StagedCertUpdate};
pub use crate::net::channel::{Channel, ChannelState, TransportLimits};
pub use crate::net::endpoint::{
    ConnectionChange, Endpoint, EndpointConfig, InboundMessage,
};
pub use crate::net::{PolicyEntry, PolicySet};
pub use crate::pki::{
    masks, TrustList, TrustStore, DEFAULT_APPLICATION_GROUP, DEFAULT_USER_TOKEN_GROUP,
};
pub use crate::scheduler::{CallbackId, Scheduler, SchedulerOp};
pub use crate::service::{
    DispatchResult, RequestInfo, ServiceDispatcher, ServiceOutcome, ServiceState,
};
pub use crate::session::{
    ActivationIdentity, SessionConfig, SessionId, SessionManager, UserAccount,
};
pub use crate::status::StatusCode;

//! Common imports for typical client usage.
pub use crate::interceptor::{
    AuthenticationInterceptor, EnvCredentials, ErrorNormalizationInterceptor, Interceptor,
    LoggingInterceptor, MetricsInterceptor, RetryMarkingInterceptor,
};
pub use crate::quality::HttpProbe;
pub use crate::{
    CancelHandle, ClientError, EventStream, NetworkSummary, OutboundRequest, ResilienceConfig,
    ReqwestTransport, StreamClient, StreamEvent, StreamFailure, StreamOutput,
};

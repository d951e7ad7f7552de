pub mod broker;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod session;
pub mod subscription;

pub use broker::{BrokerTransport, Credentials, DeliverySink, MemoryBroker, WsTransport};
pub use consumer::{ChannelConsumer, ConsumerOptions, ConsumerSummary};
pub use dispatch::{EventDispatcher, LogHandler, MessageHandler, StatsTracker};
pub use endpoint::{Endpoint, Scheme};
pub use error::{ConfigError, ConnectError, ConsumerError, HandlerError, SubscribeError};
pub use event::DeliveredEvent;
pub use session::{SessionEvent, SessionManager, SessionOptions};
pub use subscription::{ChannelHandle, ChannelSubscriptions, StartPosition};

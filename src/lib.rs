pub mod bus;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod model;
pub mod notification;
pub mod transport;
pub mod wings;

pub use bus::{LinkBus, LinkSubscription};
pub use endpoint::{Endpoint, LinkProgress};
pub use error::{LinkError, Result, WingsError};
pub use model::{
    Destination, EndpointKind, LinkEvent, LinkGrant, LinkInfo, LinkState, LinkStep,
    ShareNotification, StepResult,
};
pub use notification::{LogNotifier, Notifier};
pub use transport::{Deliverer, DeliveryOutcome, HttpDeliverer};
pub use wings::{Wings, WingsBuilder};

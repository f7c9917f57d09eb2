//! External collaborators: the reference feed and brokerage gateways.

mod broker;
mod feed_client;
mod http_broker;
mod paper_broker;
mod types;

pub use broker::{bounded, BrokerGateway, BrokerPosition};
pub use feed_client::FeedClient;
pub use http_broker::HttpBroker;
pub use paper_broker::PaperBroker;

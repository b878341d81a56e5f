//! SeaORM Entity Crate
//!
//! Defines the SeaORM entities that map to database tables.

pub mod access_log;
pub mod node;
pub mod node_inbound;
pub mod subscription;
pub mod subscription_node;

pub mod prelude {
    pub use super::node::Entity as Node;
    pub use super::node::Model as NodeModel;
    pub use super::node::ActiveModel as NodeActiveModel;
    pub use super::node::Column as NodeColumn;

    pub use super::node_inbound::Entity as NodeInbound;
    pub use super::node_inbound::Model as NodeInboundModel;
    pub use super::node_inbound::ActiveModel as NodeInboundActiveModel;
    pub use super::node_inbound::Column as NodeInboundColumn;

    pub use super::subscription::Entity as Subscription;
    pub use super::subscription::Model as SubscriptionModel;
    pub use super::subscription::ActiveModel as SubscriptionActiveModel;
    pub use super::subscription::Column as SubscriptionColumn;

    pub use super::subscription_node::Entity as SubscriptionNode;
    pub use super::subscription_node::Model as SubscriptionNodeModel;
    pub use super::subscription_node::ActiveModel as SubscriptionNodeActiveModel;
    pub use super::subscription_node::Column as SubscriptionNodeColumn;

    pub use super::access_log::Entity as AccessLog;
    pub use super::access_log::Model as AccessLogModel;
    pub use super::access_log::ActiveModel as AccessLogActiveModel;
    pub use super::access_log::Column as AccessLogColumn;
}

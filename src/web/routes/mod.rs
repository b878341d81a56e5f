pub mod node_routes;
pub mod public_routes;
pub mod subscription_routes;

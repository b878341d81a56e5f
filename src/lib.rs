pub mod db;
pub mod gateway;
pub mod links;
pub mod reconcile;
pub mod server;
pub mod services;
pub mod version;
pub mod web;

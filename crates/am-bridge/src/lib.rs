pub mod adapter;
pub mod api_error;
pub mod batcher;
pub mod connection;
pub mod flow_control;
pub mod http_api;
pub mod protocol;
pub mod terminal_ws;

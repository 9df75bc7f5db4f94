pub mod direct_transport;
pub mod registry;
pub mod transport;
pub mod web_socket_transport;

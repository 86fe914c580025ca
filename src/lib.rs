pub mod checkout;
pub mod metrics;
pub mod paymongo;
pub mod server;
pub mod settings;
pub mod store;

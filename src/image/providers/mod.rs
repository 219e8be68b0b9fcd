//! Try-on providers.

mod google;
mod grsai;

pub use google::{GoogleModel, GoogleProvider, GoogleProviderBuilder};
pub use grsai::{
    GrsaiModel, GrsaiProvider, GrsaiProviderBuilder, DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT,
    GARMENT_PLACEHOLDER,
};

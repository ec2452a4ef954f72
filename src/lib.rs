#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![cfg_attr(
    feature = "cargo-clippy",
    allow(
        clippy::unreadable_literal,
        clippy::cognitive_complexity,
        clippy::float_cmp,
        clippy::match_like_matches_macro,
        clippy::derive_partial_eq_without_eq
    )
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![cfg_attr(test, type_length_limit = "80000000")]
#![doc(html_root_url = "https://docs.rs/netcore/0.1.0")]

mod address;
mod cmap;
pub mod error;
mod event;
mod resolver;
mod stream;
mod tls;
pub mod verify;

pub use address::{ConnectSpec, Destination, AddressList, Scheme};
pub use cmap::{
    ConnectionPool, ConnectionPoolOptions, LoadState, PooledStream, RequestSocketFuture,
    TlsConnector,
};
pub use error::{Error, Result};
pub use resolver::{Resolver, TokioResolver};
#[cfg(feature = "dns-resolver")]
pub use resolver::HickoryResolver;
pub use stream::{BoxFuture, ByteStream, PlaintextStream};
pub use tls::{ClientCertificate, TlsState, TlsStream, TlsStreamConfig};
pub use verify::{CertStatus, CertVerifier, CertificateChain, VerificationResult, VerifyRequest};

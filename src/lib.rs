//! Local-network control plane for Yamaha MusicCast devices: SSDP
//! discovery, a YXC REST client, a UPnP A/V control/eventing layer, and one
//! supervised Agent task per device that merges both into a single typed
//! state snapshot with pubsub deltas.

use thiserror::Error;

pub mod agent;
pub mod config;
pub mod discovery;
pub mod ingress;
pub mod registry;
pub mod state;
pub mod supervisor;
pub mod upnp;
pub mod yxc;

pub use agent::{Agent, AgentHandle};
pub use config::Config;
pub use ingress::CallbackOutcome;
pub use registry::{PubSub, Registry};
pub use supervisor::Supervisor;
pub use yxc::YxcErrorKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("XML error: {0}")]
    Xml(#[from] instant_xml::Error),
    #[error("XML error: {error:#} while parsing {text}")]
    XmlParse {
        error: instant_xml::Error,
        text: String,
    },
    #[error("unexpected or malformed response: {0}")]
    InvalidResponse(String),
    #[error("UPnP fault {}: {}", .0.code, .0.description)]
    Upnp(upnp::UpnpErrorDetail),
    #[error("GENA subscription rejected with 412 Precondition Failed")]
    PreconditionFailed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("request error: {0:#}")]
    Reqwest(#[from] reqwest::Error),
    #[error("invalid URL: {0:#}")]
    InvalidUri(#[from] url::ParseError),
    #[error("I/O error: {0:#}")]
    Io(#[from] std::io::Error),
    #[error("YXC error: {0}")]
    Yxc(#[from] YxcErrorKind),
    #[error("device {0} is already registered")]
    AlreadyRegistered(String),
    #[error("no such device: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    ArgumentError(String),
    #[error("agent is shutting down")]
    AgentGone,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn yxc_error_converts_via_from() {
        let err: Error = YxcErrorKind::Guarded.into();
        assert!(matches!(err, Error::Yxc(YxcErrorKind::Guarded)));
    }
}

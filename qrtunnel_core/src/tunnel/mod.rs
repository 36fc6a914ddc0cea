//! Public reverse tunnel to the local file server.
//!
//! The default provider is localhost.run over SSH: the ssh client prints
//! the public `https://<id>.lhr.life` URL once the forward is up.

pub mod scanner;
pub mod supervisor;

pub use scanner::{LineEvent, LineScanner, UrlExtractor, provider_url_extractor};
pub use supervisor::{
    SshTunnelLauncher, TunnelFailure, TunnelHandle, TunnelLauncher, TunnelState,
    check_tunnel_binary,
};

//! Structs and enums derived from the config file using [`serde`]. Both
//! binaries share one file; each of them only reads its own section:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:50051"
//! name = "greeter"
//!
//! [client]
//! target = "127.0.0.1:50051"
//! requests = 100
//! name_prefix = "async_user"
//! ```

use std::{io, net::SocketAddr, path::Path};

use serde::{Deserialize, Serialize};

/// Global configuration options parsed from the config file. Every option has
/// a default, so an empty or missing file is valid.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Config {
    /// Server section.
    #[serde(default)]
    pub server: Server,

    /// Client section.
    #[serde(default)]
    pub client: Client,
}

/// Options for the greeter server.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Server {
    /// TCP listener bind address.
    #[serde(default = "default::listen")]
    pub listen: SocketAddr,

    /// Optional server name to show in logs.
    pub name: Option<String>,
}

/// Options for the concurrent test client.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Client {
    /// Address of the greeter server.
    #[serde(default = "default::target")]
    pub target: SocketAddr,

    /// Number of concurrent requests to send in one batch.
    #[serde(default = "default::requests")]
    pub requests: usize,

    /// Prefix for the generated request names. Request `i` carries the name
    /// `"{name_prefix}_{i}"`.
    #[serde(default = "default::name_prefix")]
    pub name_prefix: String,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: default::listen(),
            name: None,
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self {
            target: default::target(),
            requests: default::requests(),
            name_prefix: default::name_prefix(),
        }
    }
}

impl Config {
    /// Reads and parses the config file at `path`. A missing file is not an
    /// error, it simply yields [`Config::default`], since all the options
    /// can be set from the command line as well.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, crate::Error> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }
}

mod default {
    //! Default values for some configuration options.

    use std::net::SocketAddr;

    pub fn listen() -> SocketAddr {
        "0.0.0.0:50051".parse().unwrap()
    }

    pub fn target() -> SocketAddr {
        "127.0.0.1:50051".parse().unwrap()
    }

    pub fn requests() -> usize {
        100
    }

    pub fn name_prefix() -> String {
        String::from("async_user")
    }
}

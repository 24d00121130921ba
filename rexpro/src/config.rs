// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde_derive::Deserialize;

/// Where and how to reach the graph server.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// The server to connect to.
    pub host: String,

    /// The RexPro port on that server.
    pub port: u16,

    /// The graph to bind sessions to.
    pub graph_name: String,

    /// The variable name sessions bind the graph object to.
    #[serde(default = "default_graph_obj_name")]
    pub graph_obj_name: String,

    /// Credentials, ignored by servers with auth turned off.
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,

    /// Deadline in milliseconds for individual socket operations.
    /// Unset means operations block until the kernel gives up.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// How many live connections a pool built from this config may hold.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_graph_obj_name() -> String {
    String::from("g")
}

fn default_pool_size() -> usize {
    10
}

impl Config {
    pub fn new<H, G>(host: H, port: u16, graph_name: G) -> Config
    where
        H: Into<String>,
        G: Into<String>,
    {
        Config {
            host: host.into(),
            port,
            graph_name: graph_name.into(),
            graph_obj_name: default_graph_obj_name(),
            username: String::new(),
            password: String::new(),
            timeout_ms: None,
            pool_size: default_pool_size(),
        }
    }

    /// Load a config from a toml file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        let config_str = fs::read_to_string(path.as_ref()).context("reading config toml")?;
        let config = toml::from_str(&config_str).context("parsing config file")?;
        Ok(config)
    }

    pub fn credentials<U, W>(mut self, username: U, password: W) -> Config
    where
        U: Into<String>,
        W: Into<String>,
    {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn graph_obj_name<G: Into<String>>(mut self, graph_obj_name: G) -> Config {
        self.graph_obj_name = graph_obj_name.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Config {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn pool_size(mut self, pool_size: usize) -> Config {
        self.pool_size = pool_size;
        self
    }

    /// The socket deadline as a duration, if one is configured.
    pub fn socket_timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

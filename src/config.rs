/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::channel::ChannelSettings;
use crate::error::{Error, Result};
use crate::executor::ExecutorSettings;
use crate::net::SyntheticConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// Directory for log files; stderr only when unset.
    pub dir: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetConfig {
    pub hostname: Option<String>,
    /// statsd endpoint, e.g. "127.0.0.1:8125"; metrics go to the debug log
    /// when unset.
    pub statsd: Option<String>,
    pub channel: ChannelSettings,
    pub executor: ExecutorSettings,
    pub synthetic: SyntheticConfig,
    pub log: LogConfig,
}

impl NetConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("read {}: {}", path.as_ref().display(), e))
        })?;
        serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("parse {}: {}", path.as_ref().display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use super::*;
    use crate::channel::ChannelMode;

    #[test]
    fn defaults_are_sane() {
        let config = NetConfig::default();
        assert_eq!(config.channel.mode, ChannelMode::Stream);
        assert!(config.channel.capacity > 0);
        assert_eq!(config.executor.max_restarts, 3);
        assert!(config.statsd.is_none());
    }

    #[test]
    fn yaml_roundtrip_with_humantime_durations() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{}",
            r#"
hostname: probe-1
statsd: 127.0.0.1:8125
channel:
  capacity: 64
  mode: pooled
executor:
  max_restarts: 5
  restart_delay: 250ms
  close_grace: 10s
synthetic:
  rate_pps: 1000
  max_packets: 10000
  flows: 8
"#
        )
        .unwrap();

        let config = NetConfig::load(file.path()).unwrap();
        assert_eq!(config.hostname.as_deref(), Some("probe-1"));
        assert_eq!(config.channel.capacity, 64);
        assert_eq!(config.channel.mode, ChannelMode::Pooled);
        assert_eq!(config.executor.max_restarts, 5);
        assert_eq!(config.executor.restart_delay, Duration::from_millis(250));
        assert_eq!(config.executor.close_grace, Duration::from_secs(10));
        assert_eq!(config.synthetic.rate_pps, 1000);
        assert_eq!(config.synthetic.max_packets, Some(10000));
        // unspecified fields keep their defaults
        assert_eq!(config.synthetic.ports.len(), 3);
    }

    #[test]
    fn missing_file_is_a_config_error() {
        assert!(matches!(
            NetConfig::load("/nonexistent/netchannels.yaml"),
            Err(Error::Config(_))
        ));
    }
}

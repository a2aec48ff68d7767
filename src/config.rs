//! Server-level configuration knobs.

use std::time::Duration;

/// Tunable server behavior. Defaults to a 5-second send timeout and
/// identity checking disabled, so a deployment that never enables identity
/// checking keeps accept-by-default behavior.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ServerOptions {
    /// How long a send may take before the stream is torn down.
    pub send_timeout: Duration,
    /// Whether to enforce the SPIFFE identity check during the handshake.
    pub require_identity: bool,
    /// Starting value for the process-wide connection-id counter; exposed
    /// for deterministic tests and for resuming a counter across a
    /// coordinated restart.
    pub node_counter_start: u64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            send_timeout: Duration::from_secs(5),
            require_identity: false,
            node_counter_start: 0,
        }
    }
}

impl ServerOptions {
    /// Starts a builder seeded with the defaults.
    pub fn builder() -> ServerOptionsBuilder {
        ServerOptionsBuilder::default()
    }
}

/// Builder for [`ServerOptions`].
#[derive(Debug, Clone, Default)]
pub struct ServerOptionsBuilder {
    send_timeout: Option<Duration>,
    require_identity: Option<bool>,
    node_counter_start: Option<u64>,
}

impl ServerOptionsBuilder {
    /// Overrides the send timeout.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Overrides whether identity checking is enforced.
    pub fn require_identity(mut self, require: bool) -> Self {
        self.require_identity = Some(require);
        self
    }

    /// Overrides the connection-id counter's starting value.
    pub fn node_counter_start(mut self, start: u64) -> Self {
        self.node_counter_start = Some(start);
        self
    }

    /// Builds the final [`ServerOptions`], filling unset fields with defaults.
    pub fn build(self) -> ServerOptions {
        let defaults = ServerOptions::default();
        ServerOptions {
            send_timeout: self.send_timeout.unwrap_or(defaults.send_timeout),
            require_identity: self.require_identity.unwrap_or(defaults.require_identity),
            node_counter_start: self.node_counter_start.unwrap_or(defaults.node_counter_start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let options = ServerOptions::default();
        assert_eq!(options.send_timeout, Duration::from_secs(5));
        assert!(!options.require_identity);
        assert_eq!(options.node_counter_start, 0);
    }

    #[test]
    fn builder_overrides_only_the_fields_set() {
        let options = ServerOptions::builder().require_identity(true).build();
        assert!(options.require_identity);
        assert_eq!(options.send_timeout, Duration::from_secs(5));
    }
}

use std::time::Duration;

/// Default request timeout before abandoning an inflight request to a non-responding peer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(2000); // 2 seconds
/// Default idle window for stream connections.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
/// Period of the liveness maintenance task.
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_millis(1000);
/// Maximum liveness probes in flight at once.
pub const DEFAULT_MAX_INFLIGHT_PROBES: usize = 5;
/// Bytes asked from a stream socket per read.
pub const DEFAULT_STREAM_READ_CHUNK: usize = 256;
pub const MAX_DATAGRAM_SIZE: usize = 2048;
/// Protocol version spoken by this node.
pub const DEFAULT_VERSION: u32 = 1;

#[derive(Debug, Clone)]
/// Transport and maintenance configuration.
pub struct Config {
    /// Window without any read or write after which a channel is reported idle.
    ///
    /// [Duration::ZERO] disables idle detection.
    ///
    /// Defaults to [DEFAULT_IDLE_TIMEOUT]
    pub idle_timeout: Duration,
    /// How long [crate::channel::DatagramChannel::request] and
    /// [crate::channel::StreamChannel::request] wait for a response.
    ///
    /// Defaults to [DEFAULT_REQUEST_TIMEOUT]
    pub request_timeout: Duration,
    /// Size of a single stream read.
    ///
    /// Defaults to [DEFAULT_STREAM_READ_CHUNK]
    pub stream_read_chunk: usize,
    /// Largest datagram accepted.
    ///
    /// Defaults to [MAX_DATAGRAM_SIZE]
    pub max_datagram_size: usize,
    /// Tick period of [crate::maintenance::MaintenanceTask].
    ///
    /// Defaults to [DEFAULT_MAINTENANCE_INTERVAL]
    pub maintenance_interval: Duration,
    /// Cap on concurrent liveness probes.
    ///
    /// Defaults to [DEFAULT_MAX_INFLIGHT_PROBES]
    pub max_inflight_probes: usize,
    /// Protocol version; requests with another version are refused.
    ///
    /// Defaults to [DEFAULT_VERSION]
    pub version: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stream_read_chunk: DEFAULT_STREAM_READ_CHUNK,
            max_datagram_size: MAX_DATAGRAM_SIZE,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
            max_inflight_probes: DEFAULT_MAX_INFLIGHT_PROBES,
            version: DEFAULT_VERSION,
        }
    }
}

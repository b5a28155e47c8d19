//! Default names, capacities and rendezvous timing.
//!
//! These match what the XTSC co-simulation producer expects: it creates a
//! POSIX shared memory object named after [`DEFAULT_REGION_NAME`], suffixed
//! with its process id when it exports [`TOKEN_ENV_VAR`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use xtsc_shm::broker::BrokerConfig;
//! use xtsc_shm::defaults;
//!
//! let config = BrokerConfig::default()
//!     .with_max_regions(defaults::MAX_REGIONS * 2);
//! ```

use std::time::Duration;

// =============================================================================
// Names
// =============================================================================

/// Base object name used when a device does not set `name`.
pub const DEFAULT_REGION_NAME: &str = "SharedRAM_L";

/// Label attached to every guest mapping (the device id in the device tree).
pub const DEVICE_LABEL: &str = "goldfish_xtsc";

/// Environment variable holding the producer's process token.
pub const TOKEN_ENV_VAR: &str = "XTSC_PID";

// =============================================================================
// Capacities
// =============================================================================

/// Maximum number of concurrently live regions.
pub const MAX_REGIONS: usize = 16;

/// Maximum number of concurrently attached device instances.
pub const MAX_INSTANCES: usize = 16;

// =============================================================================
// Rendezvous
// =============================================================================

/// Number of open attempts before giving up on the producer.
pub const RENDEZVOUS_ATTEMPTS: u32 = 10;

/// Pause between two open attempts.
pub const RENDEZVOUS_INTERVAL: Duration = Duration::from_secs(1);

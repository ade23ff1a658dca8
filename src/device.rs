use anyhow::Result;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{
    fmt::{self, Debug},
    sync::Arc,
};

/// Device builders.
pub mod builders {
    use super::*;

    /// A builder for creating a [`Device`].
    #[derive(Default, Debug)]
    pub struct DeviceBuilder {
        threads: Option<usize>,
    }

    impl DeviceBuilder {
        /// The number of worker threads. Defaults to serial execution.
        ///
        /// 0 uses rayon's default, typically the number of logical cores.
        pub fn threads(self, threads: usize) -> Self {
            Self {
                threads: Some(threads),
            }
        }
        /// Builds the device.
        ///
        /// **Errors**
        /// - The thread pool could not be created.
        pub fn build(self) -> Result<Device> {
            let Self { threads } = self;
            let pool = if let Some(threads) = threads {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|index| format!("lenet-worker-{index}"))
                    .build()?;
                Some(Arc::new(pool))
            } else {
                None
            };
            Ok(Device { pool })
        }
    }
}
use builders::DeviceBuilder;

/// Device.
///
/// The execution context passed into every numeric operation. The host device runs
/// everything on the calling thread, a device with threads distributes independent
/// per sample work of a batch over its own thread pool.
///
/// Every sample writes a disjoint part of the output, so a threaded device produces the
/// same values as the host.
#[derive(Clone, Default)]
pub struct Device {
    pool: Option<Arc<ThreadPool>>,
}

impl Device {
    /// Returns the host device.
    ///
    /// The host is stateless, all [`host()`](Device::host())'s are equivalent.
    pub fn host() -> Self {
        Self::default()
    }
    /// A builder for creating a device.
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder::default()
    }
    /// Whether this is the serial host.
    pub fn is_host(&self) -> bool {
        self.pool.is_none()
    }
    /// Whether work is distributed over a thread pool.
    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }
    /// The number of threads used.
    pub fn threads(&self) -> usize {
        self.pool
            .as_ref()
            .map_or(1, |pool| pool.current_num_threads())
    }
    /// Runs `f` within the device's thread pool.
    ///
    /// Parallel iterators spawned in `f` run on that pool. On the host, `f` is simply
    /// called.
    pub fn install<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        if let Some(pool) = self.pool.as_ref() {
            pool.install(f)
        } else {
            f()
        }
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        match (self.pool.as_ref(), other.pool.as_ref()) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for Device {}

impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_host() {
            f.write_str("Host")
        } else {
            f.debug_struct("Device")
                .field("threads", &self.threads())
                .finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_devices_are_equal() {
        assert_eq!(Device::host(), Device::host());
        assert!(Device::host().is_host());
        assert_eq!(Device::host().threads(), 1);
    }

    #[test]
    fn threaded_device() -> Result<()> {
        let device = Device::builder().threads(2).build()?;
        assert!(device.is_parallel());
        assert_eq!(device.threads(), 2);
        assert_eq!(device, device.clone());
        assert_ne!(device, Device::builder().threads(2).build()?);
        assert_eq!(device.install(rayon::current_num_threads), 2);
        Ok(())
    }
}

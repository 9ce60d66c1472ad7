//! BLE discovery through BlueZ.
//!
//! Each scan window runs one LE discovery session. BlueZ reports a device
//! again whenever its properties change, so a beacon that keeps advertising
//! yields a fresh RSSI sample several times per window. Dropping the event
//! stream ends the session.
//!
//! Builds without the `bluetooth` feature get a source that always reports
//! [`ScanError::Unsupported`].

#[cfg(feature = "bluetooth")]
pub use bluez::BluezSource;
#[cfg(not(feature = "bluetooth"))]
pub use unsupported::BluezSource;

#[cfg(feature = "bluetooth")]
mod bluez {
    use std::time::Duration;

    use async_trait::async_trait;
    use beaconwatch_core::{Observation, ObservationSource, ScanError, ScanResult};
    use bluer::{
        Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, ErrorKind, Session,
    };
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tracing::{debug, info, trace};

    /// Observation source backed by a BlueZ adapter.
    pub struct BluezSource {
        adapter: Adapter,
        _session: Session,
    }

    impl std::fmt::Debug for BluezSource {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("BluezSource")
                .field("adapter", &self.adapter.name())
                .finish_non_exhaustive()
        }
    }

    impl BluezSource {
        /// Open `adapter` (for example `hci0`), or the default adapter, and
        /// power it on if needed.
        ///
        /// # Errors
        ///
        /// Returns an error if BlueZ is unreachable, the adapter does not
        /// exist, or it cannot be powered on.
        pub async fn open(adapter: Option<&str>) -> ScanResult<Self> {
            let session = Session::new()
                .await
                .map_err(|e| ScanError::SessionInitFailed {
                    message: e.to_string(),
                })?;

            let adapter = match adapter {
                Some(name) => session.adapter(name),
                None => session.default_adapter().await,
            }
            .map_err(|e| match e.kind {
                ErrorKind::NotFound => ScanError::AdapterNotFound,
                _ => ScanError::SessionInitFailed {
                    message: e.to_string(),
                },
            })?;

            let powered = adapter.is_powered().await.map_err(|e| match e.kind {
                ErrorKind::NotFound => ScanError::AdapterNotFound,
                _ => ScanError::SessionInitFailed {
                    message: e.to_string(),
                },
            })?;
            if !powered {
                debug!(adapter = adapter.name(), "Powering on Bluetooth adapter");
                adapter
                    .set_powered(true)
                    .await
                    .map_err(|_| ScanError::AdapterPoweredOff)?;
            }

            adapter
                .set_discovery_filter(DiscoveryFilter {
                    transport: DiscoveryTransport::Le,
                    duplicate_data: true,
                    ..DiscoveryFilter::default()
                })
                .await
                .map_err(discovery_failed)?;

            info!(adapter = adapter.name(), "Bluetooth adapter ready");
            Ok(Self {
                adapter,
                _session: session,
            })
        }

        async fn observe(&self, address: Address) -> bluer::Result<Option<Observation>> {
            let device = self.adapter.device(address)?;
            let Some(rssi) = device.rssi().await? else {
                return Ok(None);
            };

            let observation = Observation::new(address.to_string(), rssi);
            Ok(Some(match device.name().await? {
                Some(name) => observation.with_name(name),
                None => observation,
            }))
        }
    }

    #[async_trait]
    impl ObservationSource for BluezSource {
        async fn scan(
            &mut self,
            window: Duration,
            sink: mpsc::Sender<Observation>,
        ) -> ScanResult<()> {
            let events = self
                .adapter
                .discover_devices_with_changes()
                .await
                .map_err(discovery_failed)?;
            tokio::pin!(events);

            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    () = &mut deadline => break,
                    event = events.next() => match event {
                        Some(AdapterEvent::DeviceAdded(address)) => {
                            match self.observe(address).await {
                                Ok(Some(observation)) => {
                                    if sink.send(observation).await.is_err() {
                                        break;
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => trace!(
                                    %address,
                                    error = %e,
                                    "Device vanished before it could be read"
                                ),
                            }
                        }
                        Some(_) => {}
                        None => {
                            return Err(ScanError::DiscoveryFailed {
                                message: "discovery stream ended".to_string(),
                            })
                        }
                    },
                }
            }

            Ok(())
        }
    }

    #[allow(clippy::needless_pass_by_value)]
    fn discovery_failed(e: bluer::Error) -> ScanError {
        ScanError::DiscoveryFailed {
            message: e.to_string(),
        }
    }
}

#[cfg(not(feature = "bluetooth"))]
mod unsupported {
    use std::time::Duration;

    use async_trait::async_trait;
    use beaconwatch_core::{Observation, ObservationSource, ScanError, ScanResult};
    use tokio::sync::mpsc;

    const REASON: &str = "built without the `bluetooth` feature";

    /// Placeholder for builds without BlueZ support.
    #[derive(Debug)]
    pub struct BluezSource;

    impl BluezSource {
        /// Always fails: discovery is not compiled in.
        ///
        /// # Errors
        ///
        /// Always returns [`ScanError::Unsupported`].
        #[allow(clippy::unused_async)]
        pub async fn open(_adapter: Option<&str>) -> ScanResult<Self> {
            Err(ScanError::Unsupported {
                reason: REASON.to_string(),
            })
        }
    }

    #[async_trait]
    impl ObservationSource for BluezSource {
        async fn scan(
            &mut self,
            _window: Duration,
            _sink: mpsc::Sender<Observation>,
        ) -> ScanResult<()> {
            Err(ScanError::Unsupported {
                reason: REASON.to_string(),
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_open_reports_unsupported() {
            let result = BluezSource::open(None).await;
            assert!(matches!(result, Err(ScanError::Unsupported { .. })));
        }
    }
}

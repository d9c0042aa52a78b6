//! [`Transport`] over Bluetooth Low Energy, using the platform adapter via `bluest`.

use std::collections::HashMap;

use bluest::Adapter;
use bluest::Characteristic as GattCharacteristic;
use bluest::Device;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use crate::error::{Error, Result};
use crate::transport::{Characteristic, Transport};

pub struct BleTransport {
    adapter: Adapter,
    scan_timeout: Duration,
    link: Option<Link>,
}

/// An open connection and everything hanging off it.
struct Link {
    device: Device,
    characteristics: HashMap<Characteristic, GattCharacteristic>,
    subscriptions: HashMap<Characteristic, JoinHandle<()>>,
}

impl BleTransport {
    /// Open the default Bluetooth adapter.
    ///
    /// `scan_timeout` bounds how long [`Transport::connect`] looks for a device that
    /// is not already known to the adapter.
    pub async fn new(scan_timeout: Duration) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| Error::Connection("Default adapter not found".into()))?;
        adapter.wait_available().await.map_err(connection_error)?;

        Ok(Self { adapter, scan_timeout, link: None })
    }

    /// Find the device with the given address, first among the devices the adapter is
    /// already connected to, then by scanning.
    async fn find_device(&self, address: &str) -> Result<Device> {
        let connected = self.adapter.connected_devices().await.map_err(connection_error)?;
        if let Some(device) = connected.into_iter().find(|d| matches_address(d, address)) {
            return Ok(device);
        }

        tracing::debug!(address, "scanning for device");
        let search = async {
            let mut adapter_events = self.adapter.scan(&[]).await.map_err(connection_error)?;
            while let Some(advertised) = adapter_events.next().await {
                if matches_address(&advertised.device, address) {
                    return Ok(advertised.device);
                }
            }
            Err(Error::Connection("scan ended".into()))
        };

        timeout(self.scan_timeout, search)
            .await
            .map_err(|_| Error::Connection(format!("Device {address} not found")))?
    }

    async fn discover_characteristics(
        device: &Device,
    ) -> Result<HashMap<Characteristic, GattCharacteristic>> {
        let mut found = HashMap::new();
        for service in device.discover_services().await.map_err(connection_error)? {
            for gatt in service.discover_characteristics().await.map_err(connection_error)? {
                let uuid = gatt.uuid();
                if let Some(characteristic) = Characteristic::ALL.into_iter().find(|c| c.uuid() == uuid) {
                    found.insert(characteristic, gatt);
                }
            }
        }

        if let Some(missing) = Characteristic::ALL.into_iter().find(|c| !found.contains_key(c)) {
            return Err(Error::Connection(format!(
                "The device does not support the {missing} characteristic."
            )));
        }

        Ok(found)
    }

    fn characteristic(&self, characteristic: Characteristic) -> Result<GattCharacteristic> {
        self.link
            .as_ref()
            .ok_or_else(|| Error::Connection("not connected".into()))?
            .characteristics
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| Error::Connection(format!("{characteristic} not discovered")))
    }
}

impl Transport for BleTransport {
    async fn connect(&mut self, address: &str) -> Result<()> {
        self.disconnect().await;

        let device = self.find_device(address).await?;
        self.adapter
            .connect_device(&device)
            .await
            .map_err(connection_error)?;

        // Held before discovery so that a failed discovery still gets disconnected
        self.link = Some(Link {
            device: device.clone(),
            characteristics: HashMap::new(),
            subscriptions: HashMap::new(),
        });

        let characteristics = Self::discover_characteristics(&device).await?;
        if let Some(link) = self.link.as_mut() {
            link.characteristics = characteristics;
        }

        Ok(())
    }

    async fn disconnect(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };

        for (_, task) in link.subscriptions {
            task.abort();
        }

        if let Err(err) = self.adapter.disconnect_device(&link.device).await {
            tracing::warn!(%err, "failed to disconnect battery");
        }
    }

    async fn write(&mut self, characteristic: Characteristic, bytes: &[u8]) -> Result<()> {
        let gatt = self.characteristic(characteristic)?;
        gatt.write(bytes).await.map_err(|err| Error::Write {
            characteristic,
            reason: err.to_string(),
        })
    }

    async fn subscribe(
        &mut self,
        characteristic: Characteristic,
        handler: mpsc::Sender<Vec<u8>>,
    ) -> Result<()> {
        let gatt = self.characteristic(characteristic)?;
        let (ready_tx, ready_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut notifications = match gatt.notify().await {
                Ok(notifications) => {
                    let _ = ready_tx.send(Ok(()));
                    notifications
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };

            while let Some(notification) = notifications.next().await {
                match notification {
                    Ok(data) => {
                        if handler.send(data).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "notification error");
                        break;
                    }
                }
            }

            tracing::debug!("end of notification stream");
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(connection_error(err)),
            Err(_) => return Err(Error::Connection("notification task ended".into())),
        }

        if let Some(link) = self.link.as_mut() {
            if let Some(previous) = link.subscriptions.insert(characteristic, task) {
                previous.abort();
            }
        }

        Ok(())
    }

    async fn unsubscribe(&mut self, characteristic: Characteristic) {
        if let Some(task) = self
            .link
            .as_mut()
            .and_then(|link| link.subscriptions.remove(&characteristic))
        {
            task.abort();
        }
    }
}

fn matches_address(device: &Device, address: &str) -> bool {
    device.id().to_string().eq_ignore_ascii_case(address)
}

fn connection_error(err: bluest::Error) -> Error {
    Error::Connection(err.to_string())
}

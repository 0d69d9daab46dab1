//! Asynchronous front end of the AC controller client.
//!
//! The device operations block on serial I/O and pacing sleeps. This client
//! runs each of them on tokio's blocking thread pool so an async caller, such
//! as a UI event loop, stays responsive. Operations still serialize through
//! the shared [`SafeAcClient`].
//!
//! All client methods are `async` and must be `.await`ed.
use crate::ac_protocol::{EnableFlags, SetpointQuad};
use crate::ac_safe_client::SafeAcClient;
use crate::error::{Result, TransportError};
use crate::transport::Transport;

/// Asynchronous AC controller client.
#[derive(Debug)]
pub struct AsyncAcClient<T> {
    inner: SafeAcClient<T>,
}

impl<T> Clone for AsyncAcClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport + Send + 'static> AsyncAcClient<T> {
    pub fn new(inner: SafeAcClient<T>) -> Self {
        Self { inner }
    }

    /// Opens the client on `transport` and applies the connect-time policy
    /// off the async thread.
    pub async fn connect(transport: T, unit: u8) -> Result<Self> {
        match tokio::task::spawn_blocking(move || SafeAcClient::connect(transport, unit)).await {
            Ok(inner) => Ok(Self::new(inner)),
            Err(error) => Err(join_error(error)),
        }
    }

    /// The blocking client behind this one.
    pub fn blocking(&self) -> &SafeAcClient<T> {
        &self.inner
    }

    async fn run<R, F>(&self, operation: F) -> Result<R>
    where
        F: FnOnce(&SafeAcClient<T>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let client = self.inner.clone();
        match tokio::task::spawn_blocking(move || operation(&client)).await {
            Ok(result) => result,
            Err(error) => Err(join_error(error)),
        }
    }

    pub async fn read_enable_flags(&self) -> Result<EnableFlags> {
        self.run(|client| client.read_enable_flags()).await
    }

    /// Reads the enclosure temperature sensor in °C.
    pub async fn read_sensor_celsius(&self) -> Result<f64> {
        self.run(|client| client.read_sensor_celsius()).await
    }

    pub async fn read_setpoints(&self) -> Result<SetpointQuad> {
        self.run(|client| client.read_setpoints()).await
    }

    pub async fn write_flags(
        &self,
        power_on: bool,
        remote_setpoints: Option<bool>,
    ) -> Result<EnableFlags> {
        self.run(move |client| client.write_flags(power_on, remote_setpoints))
            .await
    }

    pub async fn set_power(&self, on: bool) -> Result<EnableFlags> {
        self.run(move |client| client.set_power(on)).await
    }

    pub async fn write_setpoints(&self, heater_c: f64, cooling_c: f64) -> Result<SetpointQuad> {
        self.run(move |client| client.write_setpoints(heater_c, cooling_c))
            .await
    }
}

fn join_error(error: tokio::task::JoinError) -> crate::error::Error {
    if error.is_panic() {
        std::panic::resume_unwind(error.into_panic());
    }
    TransportError::Io(std::io::Error::other(error)).into()
}

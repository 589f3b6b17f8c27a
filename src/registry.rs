//! Explicit home for the providers a plugin installs.
//!
//! Instead of writing the process-wide `opentelemetry::global` slots during
//! setup, the plugin registers its providers here once every setup stage has
//! succeeded. A registry accepts one tracer/meter pair; it is written once at
//! init time and only read afterwards.

use std::sync::{Arc, Mutex, PoisonError};

use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::SdkTracerProvider;

use crate::error::TelemetryError;

#[derive(Debug, Clone)]
struct Providers {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryRegistry {
    providers: Arc<Mutex<Option<Providers>>>,
}

impl TelemetryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tracer_provider(&self) -> Option<SdkTracerProvider> {
        self.lock().as_ref().map(|p| p.tracer.clone())
    }

    pub fn meter_provider(&self) -> Option<SdkMeterProvider> {
        self.lock().as_ref().map(|p| p.meter.clone())
    }

    pub fn is_registered(&self) -> bool {
        self.lock().is_some()
    }

    /// Publish the registered providers to the `opentelemetry::global` slots.
    ///
    /// Returns `false` when nothing has been registered yet.
    pub fn install_global(&self) -> bool {
        let Some(providers) = self.lock().clone() else {
            return false;
        };
        opentelemetry::global::set_tracer_provider(providers.tracer);
        opentelemetry::global::set_meter_provider(providers.meter);
        true
    }

    pub(crate) fn ensure_vacant(&self) -> Result<(), TelemetryError> {
        if self.is_registered() {
            return Err(TelemetryError::Init(
                "telemetry providers are already registered".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn register(
        &self,
        tracer: SdkTracerProvider,
        meter: SdkMeterProvider,
    ) -> Result<(), TelemetryError> {
        let mut slot = self.lock();
        if slot.is_some() {
            return Err(TelemetryError::Init(
                "telemetry providers are already registered".to_string(),
            ));
        }
        *slot = Some(Providers { tracer, meter });
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Providers>> {
        self.providers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_has_no_providers() {
        let registry = TelemetryRegistry::new();

        assert!(!registry.is_registered());
        assert!(registry.tracer_provider().is_none());
        assert!(registry.meter_provider().is_none());
        assert!(registry.ensure_vacant().is_ok());
        assert!(!registry.install_global());
    }

    #[test]
    fn registers_exactly_once() {
        let registry = TelemetryRegistry::new();
        registry
            .register(
                SdkTracerProvider::builder().build(),
                SdkMeterProvider::builder().build(),
            )
            .unwrap();

        let second = registry.register(
            SdkTracerProvider::builder().build(),
            SdkMeterProvider::builder().build(),
        );

        assert!(matches!(second, Err(TelemetryError::Init(_))));
        assert!(registry.ensure_vacant().is_err());
        assert!(registry.tracer_provider().is_some());
    }

    #[test]
    fn clones_share_state() {
        let registry = TelemetryRegistry::new();
        let view = registry.clone();
        registry
            .register(
                SdkTracerProvider::builder().build(),
                SdkMeterProvider::builder().build(),
            )
            .unwrap();

        assert!(view.meter_provider().is_some());
    }
}

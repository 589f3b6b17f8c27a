use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};

use crate::config::Config;

/// Service identity attributes. The version is omitted when empty.
pub fn base_attributes(config: &Config) -> Vec<KeyValue> {
    let mut attrs = vec![KeyValue::new(SERVICE_NAME, config.service_name.clone())];
    if !config.service_version.is_empty() {
        attrs.push(KeyValue::new(SERVICE_VERSION, config.service_version.clone()));
    }
    attrs
}

/// Build the resource shared by the tracer and meter providers.
pub fn build_resource(config: &Config) -> Resource {
    let mut attrs: Vec<KeyValue> = config
        .resource_attributes
        .iter()
        .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
        .collect();
    // Service identity goes last so it wins over a same-named custom attribute.
    attrs.extend(base_attributes(config));
    Resource::builder().with_attributes(attrs).build()
}

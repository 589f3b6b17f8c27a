//! Endpoint normalization shared by the trace and metric export paths.

const HTTPS_SCHEME: &str = "https://";
const HTTP_SCHEME: &str = "http://";

/// Returns true if the endpoint carries a URL scheme.
pub fn has_scheme(endpoint: &str) -> bool {
    endpoint.contains("://")
}

/// Removes a leading `http://` or `https://`. Other schemes are left alone.
pub fn strip_scheme(endpoint: &str) -> &str {
    endpoint
        .strip_prefix(HTTPS_SCHEME)
        .or_else(|| endpoint.strip_prefix(HTTP_SCHEME))
        .unwrap_or(endpoint)
}

/// Split an endpoint into its bare authority and whether TLS is implied.
///
/// Bare `host:port` strings are returned unchanged without TLS. A scheme,
/// when present, decides TLS and is stripped.
pub fn resolve_endpoint(endpoint: &str) -> (&str, bool) {
    if !has_scheme(endpoint) {
        return (endpoint, false);
    }
    (strip_scheme(endpoint), endpoint.starts_with(HTTPS_SCHEME))
}

/// Where an OTLP exporter should connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTarget {
    pub authority: String,
    pub tls: bool,
}

impl ExportTarget {
    /// The exporter clients take URIs, so the bare authority is requalified
    /// with the scheme matching the TLS decision.
    pub fn url(&self) -> String {
        let scheme = if self.tls { HTTPS_SCHEME } else { HTTP_SCHEME };
        format!("{}{}", scheme, self.authority)
    }
}

/// Target for the HTTP transport: TLS comes from [`resolve_endpoint`].
pub fn http_target(endpoint: &str) -> ExportTarget {
    let (authority, tls) = resolve_endpoint(endpoint);
    ExportTarget {
        authority: authority.to_string(),
        tls,
    }
}

/// Target for the stream (gRPC) transport.
///
/// The scheme is always stripped, and TLS is re-derived from the raw string
/// instead of reusing [`resolve_endpoint`]. Keep both in sync if the parsing
/// rules change.
pub fn grpc_target(endpoint: &str) -> ExportTarget {
    ExportTarget {
        authority: strip_scheme(endpoint).to_string(),
        tls: endpoint.len() > HTTPS_SCHEME.len() && endpoint.starts_with(HTTPS_SCHEME),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_endpoint_is_returned_unchanged() {
        assert_eq!(resolve_endpoint("localhost:4317"), ("localhost:4317", false));
    }

    #[test]
    fn https_endpoint_is_stripped_and_secure() {
        assert_eq!(
            resolve_endpoint("https://collector.example.com:4318"),
            ("collector.example.com:4318", true)
        );
    }

    #[test]
    fn http_endpoint_is_stripped_and_plaintext() {
        assert_eq!(
            resolve_endpoint("http://localhost:14268/api/traces"),
            ("localhost:14268/api/traces", false)
        );
    }

    #[test]
    fn unknown_scheme_is_kept() {
        assert_eq!(resolve_endpoint("grpc://host:4317"), ("grpc://host:4317", false));
    }

    #[test]
    fn http_target_requalifies_with_matching_scheme() {
        let target = http_target("https://otel.example.com");

        assert!(target.tls);
        assert_eq!(target.url(), "https://otel.example.com");
        assert_eq!(http_target("localhost:4318").url(), "http://localhost:4318");
    }

    #[test]
    fn grpc_target_checks_raw_prefix_for_tls() {
        let secure = grpc_target("https://collector:4317");
        assert_eq!(secure.authority, "collector:4317");
        assert!(secure.tls);

        let plain = grpc_target("http://collector:4317");
        assert_eq!(plain.authority, "collector:4317");
        assert!(!plain.tls);

        assert!(!grpc_target("collector:4317").tls);
        // Nothing after the scheme: the raw check requires more than the prefix.
        assert!(!grpc_target("https://").tls);
    }

    #[test]
    fn both_paths_agree_on_common_endpoints() {
        for endpoint in ["localhost:4317", "http://a:1", "https://b:2"] {
            let http = http_target(endpoint);
            let grpc = grpc_target(endpoint);
            assert_eq!(http, grpc, "diverged for {endpoint}");
        }
    }
}

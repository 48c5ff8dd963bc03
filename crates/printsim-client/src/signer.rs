//! SigV4 signing of the WebSocket upgrade request.
//!
//! AWS IoT Core authenticates a WebSocket client once, on the HTTP upgrade.
//! The signature covers the method, path, query, the signable headers and
//! the hash of an empty body. Headers that proxies are allowed to rewrite
//! (`connection`, `upgrade`, ...) are left out of the canonical request.

use crate::AuthError;
use crate::credentials::{Credentials, ProvideCredentials};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::Write as _;

type HmacSha256 = Hmac<Sha256>;

/// Service name AWS IoT Core expects in the credential scope.
pub const IOT_SERVICE: &str = "iotdevicegateway";

const ALGORITHM: &str = "AWS4-HMAC-SHA256";
const EMPTY_PAYLOAD_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// RFC 3986 unreserved characters pass through; everything else is escaped.
const UNRESERVED: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

const AUTHORIZATION: &str = "authorization";
const HOST: &str = "host";
const AMZ_DATE: &str = "x-amz-date";
const AMZ_SECURITY_TOKEN: &str = "x-amz-security-token";
const AMZ_CONTENT_SHA256: &str = "x-amz-content-sha256";

const UNSIGNABLE_HEADERS: &[&str] = &[
    "authorization",
    "cache-control",
    "connection",
    "expect",
    "from",
    "keep-alive",
    "max-forwards",
    "pragma",
    "referer",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "user-agent",
    "x-amzn-trace-id",
];

/// An HTTP-shaped request waiting to be signed.
///
/// `path` and `query` hold decoded text; the signer applies the encoding.
/// Header names are stored lower-cased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub scheme: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
}

impl PendingRequest {
    pub fn new(
        scheme: impl Into<String>,
        method: impl Into<String>,
        host: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            method: method.into(),
            host: host.into(),
            path: path.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Signs requests with credentials from `P`.
#[derive(Debug, Clone)]
pub struct SigV4Signer<P> {
    provider: P,
    region: String,
    service: String,
    apply_checksum: bool,
}

impl<P: ProvideCredentials> SigV4Signer<P> {
    pub fn new(provider: P, region: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            provider,
            region: region.into(),
            service: service.into(),
            apply_checksum: true,
        }
    }

    /// Whether to add and sign `x-amz-content-sha256`. On by default.
    pub fn apply_checksum(mut self, apply: bool) -> Self {
        self.apply_checksum = apply;
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Ask the provider for the credentials the next signature will use.
    pub async fn credentials(&self) -> Result<Credentials, AuthError> {
        self.provider.provide_credentials().await
    }

    /// Resolve credentials and sign `request` at the current time.
    pub async fn sign(&self, request: PendingRequest) -> Result<PendingRequest, AuthError> {
        let credentials = self.credentials().await?;
        self.sign_at(request, &credentials, Utc::now())
    }

    /// Sign with explicit credentials and time.
    ///
    /// Any existing `authorization` header is replaced.
    pub fn sign_at(
        &self,
        mut request: PendingRequest,
        credentials: &Credentials,
        now: DateTime<Utc>,
    ) -> Result<PendingRequest, AuthError> {
        if credentials.is_expired_at(now) {
            // is_expired_at only returns true when an expiry is present
            let expired_at = credentials.expires_at().unwrap_or(now);
            return Err(AuthError::Expired(expired_at));
        }
        if credentials.access_key_id().is_empty() || credentials.secret_access_key().is_empty() {
            return Err(AuthError::Missing("empty access key".into()));
        }
        if request.host.is_empty() {
            return Err(AuthError::InvalidRequest("request has no host".into()));
        }

        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{date}/{}/{}/aws4_request", self.region, self.service);

        request.headers.remove(AUTHORIZATION);
        if !request.headers.contains_key(HOST) {
            let host = request.host.clone();
            request.set_header(HOST, host);
        }
        request.set_header(AMZ_DATE, amz_date.as_str());
        if let Some(token) = credentials.session_token() {
            request.set_header(AMZ_SECURITY_TOKEN, token);
        }
        if self.apply_checksum {
            request.set_header(AMZ_CONTENT_SHA256, EMPTY_PAYLOAD_SHA256);
        }

        let (canonical, signed_headers) = canonical_request(&request, &self.service);
        let string_to_sign = format!(
            "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical.as_bytes()))
        );

        let mut key = hmac_sha256(
            format!("AWS4{}", credentials.secret_access_key()).as_bytes(),
            date.as_bytes(),
        )?;
        for part in [self.region.as_str(), self.service.as_str(), "aws4_request"] {
            key = hmac_sha256(&key, part.as_bytes())?;
        }
        let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

        request.set_header(
            AUTHORIZATION,
            format!(
                "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                credentials.access_key_id()
            ),
        );
        Ok(request)
    }
}

/// Returns the canonical request and its signed-header list.
fn canonical_request(request: &PendingRequest, service: &str) -> (String, String) {
    let path = canonical_path(&request.path, service);

    let mut query: Vec<(String, String)> = request
        .query
        .iter()
        .filter(|(key, _)| key != "X-Amz-Signature")
        .map(|(key, value)| (encode(key), encode(value)))
        .collect();
    query.sort();
    let query = query
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&");

    let signable: Vec<(&str, &str)> = request
        .headers
        .iter()
        .filter(|(name, _)| !UNSIGNABLE_HEADERS.contains(&name.as_str()))
        .map(|(name, value)| (name.as_str(), value.as_str()))
        .collect();

    let mut headers = String::new();
    for (name, value) in &signable {
        let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
        let _ = writeln!(headers, "{name}:{value}");
    }
    let signed_headers = signable
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(";");

    let canonical = format!(
        "{}\n{path}\n{query}\n{headers}\n{signed_headers}\n{EMPTY_PAYLOAD_SHA256}",
        request.method.to_ascii_uppercase()
    );
    (canonical, signed_headers)
}

fn encode(input: &str) -> String {
    utf8_percent_encode(input, UNRESERVED).to_string()
}

/// Each path segment is encoded on its own, twice for every service but S3.
fn canonical_path(path: &str, service: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }
    path.split('/')
        .map(|segment| {
            let once = encode(segment);
            if service == "s3" { once } else { encode(&once) }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, AuthError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| AuthError::InvalidRequest(format!("invalid signing key: {err}")))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use chrono::TimeZone;

    const AKID: &str = "AKIDEXAMPLE";
    const SECRET: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";

    fn creds() -> Credentials {
        Credentials::new(AKID, SECRET)
    }

    fn signer(service: &str) -> SigV4Signer<StaticCredentials> {
        SigV4Signer::new(StaticCredentials::new(creds()), "us-east-1", service)
    }

    fn vanilla_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap()
    }

    // AWS SigV4 test suite: get-vanilla
    #[test]
    fn aws_suite_get_vanilla() {
        let request = PendingRequest::new("https", "GET", "example.amazonaws.com", "/");
        let signed = signer("service")
            .apply_checksum(false)
            .sign_at(request, &creds(), vanilla_time())
            .unwrap();

        assert_eq!(signed.header("x-amz-date"), Some("20150830T123600Z"));
        assert_eq!(
            signed.header("authorization"),
            Some(
                "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/service/aws4_request, \
                 SignedHeaders=host;x-amz-date, \
                 Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
            )
        );
    }

    // AWS SigV4 test suite: get-vanilla-query-order-key-case
    #[test]
    fn aws_suite_query_order() {
        let request = PendingRequest::new("https", "GET", "example.amazonaws.com", "/")
            .with_query("Param2", "value2")
            .with_query("Param1", "value1");
        let signed = signer("service")
            .apply_checksum(false)
            .sign_at(request, &creds(), vanilla_time())
            .unwrap();

        let authorization = signed.header("authorization").unwrap();
        assert!(authorization.ends_with(
            "Signature=b97d918cfa904a5beff61c982a1b6f458b799221646efd99d3219ec94cdf2500"
        ));
    }

    #[test]
    fn iot_websocket_upgrade() {
        let host = "a1b2c3-ats.iot.us-east-1.amazonaws.com";
        let mut request = PendingRequest::new("wss", "GET", host, "/mqtt");
        request.set_header("Host", host);
        request.set_header("Connection", "Upgrade");
        request.set_header("Upgrade", "websocket");
        request.set_header("Sec-WebSocket-Version", "13");
        request.set_header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        request.set_header("Sec-WebSocket-Protocol", "mqtt");

        let credentials = creds().with_session_token("session-token-example");
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let signed = signer(IOT_SERVICE)
            .sign_at(request, &credentials, now)
            .unwrap();

        assert_eq!(signed.header("x-amz-security-token"), Some("session-token-example"));
        assert_eq!(signed.header("x-amz-content-sha256"), Some(EMPTY_PAYLOAD_SHA256));
        assert_eq!(signed.header("connection"), Some("Upgrade"));
        assert_eq!(
            signed.header("authorization"),
            Some(
                "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20240501/us-east-1/iotdevicegateway/aws4_request, \
                 SignedHeaders=host;sec-websocket-key;sec-websocket-protocol;sec-websocket-version;\
                 x-amz-content-sha256;x-amz-date;x-amz-security-token, \
                 Signature=e4ff7dea66e3a8d62bafe1c854c7b56a585d04084845b1086c43b6f6d5e045a1"
            )
        );
    }

    #[test]
    fn stale_authorization_is_replaced() {
        let mut request = PendingRequest::new("https", "GET", "example.amazonaws.com", "/");
        request.set_header("Authorization", "Bearer stale");
        let signed = signer("service")
            .apply_checksum(false)
            .sign_at(request, &creds(), vanilla_time())
            .unwrap();
        assert!(signed.header("authorization").unwrap().ends_with(
            "Signature=5fa00fa31553b73ebf1942676e86291e8372ff2a2260956d9b8aae1d763fbf31"
        ));
    }

    #[test]
    fn expired_credentials_are_rejected() {
        let now = vanilla_time();
        let expired = creds().with_expiry(now - chrono::TimeDelta::minutes(1));
        let request = PendingRequest::new("https", "GET", "example.amazonaws.com", "/");
        let err = signer("service").sign_at(request, &expired, now).unwrap_err();
        assert!(matches!(err, AuthError::Expired(_)));
    }

    #[test]
    fn empty_keys_are_rejected() {
        let request = PendingRequest::new("https", "GET", "example.amazonaws.com", "/");
        let err = signer("service")
            .sign_at(request, &Credentials::new("", ""), vanilla_time())
            .unwrap_err();
        assert!(matches!(err, AuthError::Missing(_)));
    }

    struct Unavailable;

    impl ProvideCredentials for Unavailable {
        async fn provide_credentials(&self) -> Result<Credentials, AuthError> {
            Err(AuthError::Provider("metadata service unreachable".into()))
        }
    }

    #[tokio::test]
    async fn provider_failure_surfaces() {
        let signer = SigV4Signer::new(Unavailable, "us-east-1", IOT_SERVICE);
        let request = PendingRequest::new("wss", "GET", "example.com", "/mqtt");
        let err = signer.sign(request).await.unwrap_err();
        assert_eq!(
            err,
            AuthError::Provider("metadata service unreachable".into())
        );
    }

    #[tokio::test]
    async fn sign_uses_current_time() {
        let request = PendingRequest::new("wss", "GET", "example.com", "/mqtt");
        let before = Utc::now().format("%Y%m%d").to_string();
        let signed = signer(IOT_SERVICE).sign(request).await.unwrap();
        let date = signed.header("x-amz-date").unwrap();
        assert_eq!(date.len(), 16);
        assert!(date >= before.as_str());
        assert_eq!(signed.header("host"), Some("example.com"));
    }

    #[test]
    fn encoding() {
        assert_eq!(encode("a b/c"), "a%20b%2Fc");
        assert_eq!(encode("~-_."), "~-_.");
        assert_eq!(encode("é"), "%C3%A9");
    }

    #[test]
    fn path_segments_are_double_encoded_outside_s3() {
        assert_eq!(canonical_path("/mqtt", IOT_SERVICE), "/mqtt");
        assert_eq!(canonical_path("", IOT_SERVICE), "/");
        assert_eq!(
            canonical_path("/documents and settings/", "service"),
            "/documents%2520and%2520settings/"
        );
        assert_eq!(
            canonical_path("/documents and settings/", "s3"),
            "/documents%20and%20settings/"
        );
        assert_eq!(canonical_path("/a%b/ü", "service"), "/a%2525b/%25C3%25BC");
    }

    #[test]
    fn canonical_request_carries_the_double_encoded_path() {
        let request = PendingRequest::new("https", "GET", "example.amazonaws.com", "/a b");
        let (canonical, signed_headers) = canonical_request(&request, IOT_SERVICE);
        assert!(canonical.starts_with("GET\n/a%2520b\n\n"), "{canonical}");
        assert_eq!(signed_headers, "");
    }
}

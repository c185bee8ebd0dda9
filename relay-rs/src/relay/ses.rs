//! AWS SES relay client
//!
//! Calls the SES query API action `SendRawEmail`, signed with SigV4:
//!
//! ```text
//! POST https://email.{region}.amazonaws.com/
//! Action=SendRawEmail&Version=2010-12-01&Source=..&Destinations.member.1=..&RawMessage.Data=<base64>
//! ```
//!
//! The message body is forwarded untouched; SES takes the envelope from
//! `Source` and `Destinations`, not from the message headers.

use super::provider::CredentialsProvider;
use super::sigv4::{self, CanonicalRequest};
use super::{DeliveryId, RelayClient, RelayError, RelayRequest};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use std::borrow::Cow;
use tracing::{debug, warn};
use url::Url;

const SERVICE: &str = "ses";
const API_VERSION: &str = "2010-12-01";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// Error codes SES returns for conditions that clear up on their own
const TRANSIENT_CODES: &[&str] = &["Throttling", "ThrottlingException", "ServiceUnavailable"];

pub struct SesClient {
    region: String,
    endpoint: Url,
    credentials: CredentialsProvider,
    client: reqwest::Client,
}

impl SesClient {
    pub fn new(
        region: impl Into<String>,
        credentials: impl Into<CredentialsProvider>,
    ) -> Result<Self, RelayError> {
        let region = region.into();
        let endpoint = Url::parse(&format!("https://email.{}.amazonaws.com/", region))
            .map_err(|e| RelayError::Provider(format!("invalid region '{}': {}", region, e)))?;

        Ok(Self {
            region,
            endpoint,
            credentials: credentials.into(),
            client: reqwest::Client::new(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Host header value as reqwest will send it
    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }
}

/// Encode the `SendRawEmail` form body
pub(crate) fn build_form(request: &RelayRequest) -> String {
    let mut form = url::form_urlencoded::Serializer::new(String::new());
    form.append_pair("Action", "SendRawEmail");
    form.append_pair("Version", API_VERSION);
    form.append_pair("Source", &request.source);
    for (i, destination) in request.destinations.iter().enumerate() {
        form.append_pair(&format!("Destinations.member.{}", i + 1), destination);
    }
    form.append_pair("RawMessage.Data", &BASE64.encode(&request.raw_message));
    form.finish()
}

/// Text content of the first `<tag>...</tag>` in an XML document, entities decoded
fn extract_tag<'a>(xml: &'a str, tag: &str) -> Option<Cow<'a, str>> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(decode_entities(xml[start..end].trim()))
}

/// Replace the predefined XML entities and numeric character references
///
/// Unknown or malformed references are kept as written.
fn decode_entities(text: &str) -> Cow<'_, str> {
    if !text.contains('&') {
        return Cow::Borrowed(text);
    }

    let mut decoded = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        decoded.push_str(&rest[..amp]);
        rest = &rest[amp..];

        let entity = rest
            .find(';')
            .and_then(|semi| decode_entity(&rest[1..semi]).map(|c| (c, semi)));
        match entity {
            Some((c, semi)) => {
                decoded.push(c);
                rest = &rest[semi + 1..];
            }
            None => {
                decoded.push('&');
                rest = &rest[1..];
            }
        }
    }
    decoded.push_str(rest);
    Cow::Owned(decoded)
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "lt" => Some('<'),
        "gt" => Some('>'),
        "amp" => Some('&'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let number = name.strip_prefix('#')?;
            let code = match number.strip_prefix('x').or_else(|| number.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// Map a non-2xx SES answer onto a relay error
pub(crate) fn parse_error_response(status: u16, body: &str) -> RelayError {
    let code = extract_tag(body, "Code")
        .map(Cow::into_owned)
        .unwrap_or_else(|| "Unknown".to_string());
    let message = extract_tag(body, "Message")
        .map(Cow::into_owned)
        .unwrap_or_else(|| format!("HTTP status {}", status));

    if status >= 500 || status == 429 || TRANSIENT_CODES.contains(&code.as_str()) {
        RelayError::Throttled { code, message }
    } else {
        RelayError::Rejected { code, message }
    }
}

pub(crate) fn parse_success_response(body: &str) -> Result<DeliveryId, RelayError> {
    match extract_tag(body, "MessageId") {
        Some(id) if !id.is_empty() => Ok(DeliveryId::new(id.into_owned())),
        _ => Err(RelayError::Provider(
            "SendRawEmail response has no MessageId".to_string(),
        )),
    }
}

#[async_trait]
impl RelayClient for SesClient {
    async fn send(&self, request: &RelayRequest) -> Result<DeliveryId, RelayError> {
        let body = build_form(request);
        let credentials = self.credentials.credentials().await?;

        let signature = sigv4::sign(
            CanonicalRequest {
                method: "POST",
                path: self.endpoint.path(),
                query: self.endpoint.query().unwrap_or_default(),
                headers: vec![
                    ("content-type".to_string(), FORM_CONTENT_TYPE.to_string()),
                    ("host".to_string(), self.host()),
                ],
                payload: body.as_bytes(),
            },
            &credentials,
            &self.region,
            SERVICE,
            Utc::now(),
        )
        .map_err(|e| RelayError::Provider(format!("request signing failed: {}", e)))?;

        debug!(
            "SendRawEmail to {} ({} destinations, {} bytes)",
            self.endpoint,
            request.destinations.len(),
            request.raw_message.len()
        );

        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header("content-type", FORM_CONTENT_TYPE)
            .header("x-amz-date", signature.amz_date)
            .header("authorization", signature.authorization);
        if let Some(ref token) = credentials.session_token {
            builder = builder.header("x-amz-security-token", token);
        }

        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        if status.is_success() {
            parse_success_response(&text)
        } else {
            let err = parse_error_response(status.as_u16(), &text);
            warn!("SendRawEmail failed with HTTP {}: {}", status, err);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::AwsCredentials;
    use bytes::Bytes;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const SUCCESS_XML: &str = r#"<SendRawEmailResponse xmlns="http://ses.amazonaws.com/doc/2010-12-01/">
  <SendRawEmailResult>
    <MessageId>0100018c-example-message-id-000000</MessageId>
  </SendRawEmailResult>
  <ResponseMetadata>
    <RequestId>e0abcdfa-c866-11e0-b6d0-273d09173b49</RequestId>
  </ResponseMetadata>
</SendRawEmailResponse>"#;

    const REJECTED_XML: &str = r#"<ErrorResponse xmlns="http://ses.amazonaws.com/doc/2010-12-01/">
  <Error>
    <Type>Sender</Type>
    <Code>MessageRejected</Code>
    <Message>Email address is not verified.</Message>
  </Error>
  <RequestId>2bd63a41-7f5d-4a1c-a2b6-1a7a2b9a3d21</RequestId>
</ErrorResponse>"#;

    fn request(destinations: &[&str]) -> RelayRequest {
        RelayRequest {
            source: "a@x.com".to_string(),
            destinations: destinations.iter().map(|d| d.to_string()).collect(),
            raw_message: Bytes::from_static(b"Subject: hi\r\n\r\nbody\r\n"),
        }
    }

    #[test]
    fn test_build_form_keeps_destination_order() {
        let form = build_form(&request(&["b@y.com", "c@y.com", "b@y.com"]));

        assert!(form.starts_with("Action=SendRawEmail&Version=2010-12-01&Source=a%40x.com"));
        let first = form.find("Destinations.member.1=b%40y.com").unwrap();
        let second = form.find("Destinations.member.2=c%40y.com").unwrap();
        let third = form.find("Destinations.member.3=b%40y.com").unwrap();
        assert!(first < second && second < third);
        assert!(form.contains("RawMessage.Data="));
    }

    #[test]
    fn test_build_form_without_destinations() {
        let form = build_form(&request(&[]));
        assert!(!form.contains("Destinations"));
    }

    #[test]
    fn test_parse_success_response() {
        let id = parse_success_response(SUCCESS_XML).unwrap();
        assert_eq!(id.as_str(), "0100018c-example-message-id-000000");

        assert!(matches!(
            parse_success_response("<SendRawEmailResponse/>"),
            Err(RelayError::Provider(_))
        ));
    }

    #[test]
    fn test_parse_error_response() {
        let err = parse_error_response(400, REJECTED_XML);
        assert_eq!(
            err,
            RelayError::Rejected {
                code: "MessageRejected".to_string(),
                message: "Email address is not verified.".to_string(),
            }
        );
        assert!(!err.is_transient());

        let throttled = parse_error_response(
            400,
            "<ErrorResponse><Error><Code>Throttling</Code><Message>Maximum sending rate exceeded.</Message></Error></ErrorResponse>",
        );
        assert!(throttled.is_transient());

        let unavailable = parse_error_response(503, "");
        assert!(unavailable.is_transient());
        assert_eq!(unavailable.to_string(), "Unknown: HTTP status 503");
    }

    #[test]
    fn test_error_message_entities_are_decoded() {
        let err = parse_error_response(
            400,
            "<ErrorResponse><Error><Code>InvalidParameterValue</Code>\
             <Message>Illegal address &quot;a&amp;b&lt;x&gt;&quot; &#39;here&#x27; &bogus; 5 &amp</Message>\
             </Error></ErrorResponse>",
        );
        assert_eq!(
            err,
            RelayError::Rejected {
                code: "InvalidParameterValue".to_string(),
                message: "Illegal address \"a&b<x>\" 'here' &bogus; 5 &amp".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_entities_borrows_plain_text() {
        assert!(matches!(decode_entities("no entities"), Cow::Borrowed("no entities")));
        assert_eq!(decode_entities("&apos;&#65;&#x42;&#xZZ;"), "'AB&#xZZ;");
    }

    #[tokio::test]
    async fn test_send_uses_provider_session_token() {
        let (endpoint, server) = serve_once("200 OK", SUCCESS_XML).await;
        let credentials = AwsCredentials::new("ASIAEXAMPLE", "secret").with_session_token("tok");
        let client = SesClient::new("us-east-1", CredentialsProvider::from(credentials))
            .unwrap()
            .with_endpoint(endpoint);

        client.send(&request(&["b@y.com"])).await.unwrap();
        let sent = server.await.unwrap().to_ascii_lowercase();
        assert!(sent.contains("x-amz-security-token: tok"));
        assert!(sent.contains("credential=asiaexample/"));
    }

    /// Serve one canned HTTP response and return what the client sent
    async fn serve_once(status: &'static str, body: &'static str) -> (Url, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap())
                        })
                        .unwrap_or(0);
                    if received.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\ncontent-type: text/xml\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).to_string()
        });

        (Url::parse(&format!("http://{}/", addr)).unwrap(), handle)
    }

    #[tokio::test]
    async fn test_send_returns_message_id() {
        let (endpoint, server) = serve_once("200 OK", SUCCESS_XML).await;
        let client = SesClient::new("us-east-1", AwsCredentials::new("AKIDEXAMPLE", "secret"))
            .unwrap()
            .with_endpoint(endpoint);

        let id = client.send(&request(&["b@y.com"])).await.unwrap();
        assert_eq!(id.as_str(), "0100018c-example-message-id-000000");

        let sent = server.await.unwrap();
        assert!(sent.starts_with("POST / HTTP/1.1"));
        assert!(sent
            .to_ascii_lowercase()
            .contains("authorization: aws4-hmac-sha256 credential=akidexample/"));
        assert!(sent.contains("Destinations.member.1=b%40y.com"));
    }

    #[tokio::test]
    async fn test_send_maps_provider_rejection() {
        let (endpoint, server) = serve_once("400 Bad Request", REJECTED_XML).await;
        let client = SesClient::new("us-east-1", AwsCredentials::new("AKIDEXAMPLE", "secret"))
            .unwrap()
            .with_endpoint(endpoint);

        let err = client.send(&request(&["b@y.com"])).await.unwrap_err();
        assert_eq!(err.to_string(), "MessageRejected: Email address is not verified.");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_maps_transport_failure() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = SesClient::new("us-east-1", AwsCredentials::new("AKIDEXAMPLE", "secret"))
            .unwrap()
            .with_endpoint(Url::parse(&format!("http://{}/", addr)).unwrap());

        let err = client.send(&request(&["b@y.com"])).await.unwrap_err();
        assert!(matches!(err, RelayError::Transport(_)));
        assert!(err.is_transient());
    }

    #[test]
    fn test_default_endpoint() {
        let client =
            SesClient::new("eu-west-1", AwsCredentials::new("AKIDEXAMPLE", "secret")).unwrap();
        assert_eq!(client.endpoint().as_str(), "https://email.eu-west-1.amazonaws.com/");
        assert_eq!(client.host(), "email.eu-west-1.amazonaws.com");
    }
}

//! Parses a Service Bus connection string and turns it into the AMQP URL the
//! transport connects with.

use thiserror::Error;
use url::Url;

/// A parsed `Endpoint=...;SharedAccessKeyName=...;SharedAccessKey=...` connection string.
#[derive(Debug, Clone)]
pub struct ConnectionString {
    /// The `sb://<host>` endpoint, host part only (scheme stripped).
    pub host: String,
    /// The shared access policy name.
    pub shared_access_key_name: String,
    /// The shared access policy key.
    pub shared_access_key: String,
}

/// Failure parsing a connection string.
#[derive(Debug, Error)]
pub enum ConnectionStringError {
    /// A required key (`Endpoint`, `SharedAccessKeyName`, `SharedAccessKey`) was missing.
    #[error("connection string is missing required key `{0}`")]
    MissingKey(&'static str),

    /// The `Endpoint` value was not a well-formed `sb://<host>` URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
}

impl ConnectionString {
    /// Parses a semicolon-delimited `key=value` connection string.
    pub fn parse(connection_string: &str) -> Result<Self, ConnectionStringError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;

        for pair in connection_string.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some((k, v)) = pair.split_once('=') else {
                continue;
            };
            match k.trim() {
                "Endpoint" => endpoint = Some(v.trim()),
                "SharedAccessKeyName" => key_name = Some(v.trim()),
                "SharedAccessKey" => key = Some(v.trim()),
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or(ConnectionStringError::MissingKey("Endpoint"))?;
        let key_name = key_name.ok_or(ConnectionStringError::MissingKey("SharedAccessKeyName"))?;
        let key = key.ok_or(ConnectionStringError::MissingKey("SharedAccessKey"))?;

        // `sb://` isn't a scheme `url` knows about; swap it for something parseable
        // and keep only the host.
        let as_https = endpoint.replacen("sb://", "https://", 1);
        let parsed = Url::parse(&as_https)?;
        let host = parsed
            .host_str()
            .ok_or(ConnectionStringError::InvalidEndpoint(
                url::ParseError::EmptyHost,
            ))?
            .to_string();

        Ok(ConnectionString {
            host,
            shared_access_key_name: key_name.to_string(),
            shared_access_key: key.to_string(),
        })
    }

    /// Builds the `amqps://<urlenc(name)>:<urlenc(key)>@<host>` URL the transport
    /// connects with.
    pub fn to_amqp_url(&self) -> String {
        format!(
            "amqps://{}:{}@{}",
            percent_encode(&self.shared_access_key_name),
            percent_encode(&self.shared_access_key),
            self.host,
        )
    }
}

fn percent_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_connection_string() {
        let cs = ConnectionString::parse(
            "Endpoint=sb://my-namespace.servicebus.windows.net/;SharedAccessKeyName=RootManageSharedAccessKey;SharedAccessKey=abc123+/==",
        )
        .unwrap();
        assert_eq!(cs.host, "my-namespace.servicebus.windows.net");
        assert_eq!(cs.shared_access_key_name, "RootManageSharedAccessKey");
        assert_eq!(cs.shared_access_key, "abc123+/==");
    }

    #[test]
    fn url_encodes_key_and_name() {
        let cs = ConnectionString {
            host: "ns.servicebus.windows.net".into(),
            shared_access_key_name: "name with spaces".into(),
            shared_access_key: "k+e/y=".into(),
        };
        let url = cs.to_amqp_url();
        assert!(url.starts_with("amqps://name+with+spaces:"));
        assert!(url.contains("@ns.servicebus.windows.net"));
    }

    #[test]
    fn missing_key_is_reported() {
        let err = ConnectionString::parse("Endpoint=sb://ns.servicebus.windows.net/").unwrap_err();
        assert!(matches!(err, ConnectionStringError::MissingKey("SharedAccessKeyName")));
    }
}

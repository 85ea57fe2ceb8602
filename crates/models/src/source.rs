use serde::{Deserialize, Serialize};

/// RemoteSource describes where a worker pulls bytes for a remote-source
/// ingest. One variant per source kind with its fixed required fields;
/// unknown kinds are rejected at deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source_type", content = "source_config", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum RemoteSource {
    Url {
        url: url_serde::HttpUrl,
    },
    S3 {
        bucket: String,
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_key_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret_access_key: Option<String>,
    },
    GoogleDrive {
        file_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        service_account: Option<String>,
    },
}

impl RemoteSource {
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteSource::Url { .. } => "url",
            RemoteSource::S3 { .. } => "s3",
            RemoteSource::GoogleDrive { .. } => "google_drive",
        }
    }

    /// A short human description for logs and status messages. Credentials
    /// never appear here.
    pub fn describe(&self) -> String {
        match self {
            RemoteSource::Url { url } => url.0.to_string(),
            RemoteSource::S3 { bucket, key, .. } => format!("s3://{bucket}/{key}"),
            RemoteSource::GoogleDrive { file_id, .. } => format!("gdrive:{file_id}"),
        }
    }
}

mod url_serde {
    use serde::{Deserialize, Deserializer, Serialize};

    /// A URL restricted to the http(s) schemes a fetch worker can stream.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct HttpUrl(pub url::Url);

    impl<'de> Deserialize<'de> for HttpUrl {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            use serde::de::Error;
            let url = url::Url::deserialize(deserializer)?;
            match url.scheme() {
                "http" | "https" => Ok(HttpUrl(url)),
                other => Err(D::Error::custom(format!(
                    "unsupported url scheme {other:?} (expected http or https)"
                ))),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn url_variant_parses() {
        let source: RemoteSource = serde_json::from_value(serde_json::json!({
            "source_type": "url",
            "source_config": {"url": "https://data.example.org/run42.tar"},
        }))
        .unwrap();
        assert_eq!(source.kind(), "url");
        assert_eq!(source.describe(), "https://data.example.org/run42.tar");
    }

    #[test]
    fn ftp_scheme_is_rejected() {
        let err = serde_json::from_value::<RemoteSource>(serde_json::json!({
            "source_type": "url",
            "source_config": {"url": "ftp://data.example.org/run42.tar"},
        }))
        .unwrap_err();
        assert!(err.to_string().contains("unsupported url scheme"));
    }

    #[test]
    fn s3_variant_keeps_credentials_out_of_descriptions() {
        let source: RemoteSource = serde_json::from_value(serde_json::json!({
            "source_type": "s3",
            "source_config": {
                "bucket": "scans",
                "key": "beamline/run42.h5",
                "access_key_id": "AKIA123",
                "secret_access_key": "shhh",
            },
        }))
        .unwrap();
        assert_eq!(source.kind(), "s3");
        assert_eq!(source.describe(), "s3://scans/beamline/run42.h5");
        assert!(!source.describe().contains("shhh"));
    }

    #[test]
    fn unknown_source_type_is_rejected() {
        let err = serde_json::from_value::<RemoteSource>(serde_json::json!({
            "source_type": "azure_blob",
            "source_config": {"container": "c"},
        }))
        .unwrap_err();
        assert!(err.to_string().contains("azure_blob"));
    }

    #[test]
    fn round_trips_through_json() {
        let source = RemoteSource::GoogleDrive {
            file_id: "1AbC".to_string(),
            service_account: None,
        };
        let json = serde_json::to_value(&source).unwrap();
        assert_eq!(json["source_type"], "google_drive");
        let back: RemoteSource = serde_json::from_value(json).unwrap();
        assert_eq!(back, source);
    }
}

use reqwest::blocking::Client;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const DEFAULT_ENDPOINT: &str = "http://169.254.169.254";
const TOKEN_TTL_SECS: u32 = 21_600;

#[derive(Debug, Error)]
pub enum ImdsError {
    #[error("instance metadata request for {path} failed: {source}")]
    Transport {
        path: String,
        source: reqwest::Error,
    },

    #[error("instance metadata returned HTTP {status} for {path}")]
    Status { path: String, status: u16 },

    #[error("unreadable instance metadata at {path}: {detail}")]
    Parse { path: String, detail: String },
}

/// Where the process learns which instance it is running on.
pub trait InstanceIdentity {
    fn instance_id(&self) -> Result<String, ImdsError>;
}

/// Temporary credentials of the instance profile role.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoleCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub token: String,
    pub expiration: String,
}

#[derive(Debug, Clone)]
pub struct Imds {
    http: Client,
    endpoint: String,
}

impl Imds {
    pub fn new() -> Result<Self, ImdsError> {
        Self::with_endpoint(DEFAULT_ENDPOINT)
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self, ImdsError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(2))
            .no_proxy()
            .build()
            .map_err(|source| ImdsError::Transport {
                path: "client".into(),
                source,
            })?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }

    fn token(&self) -> Result<String, ImdsError> {
        let path = "/latest/api/token";
        let response = self
            .http
            .put(format!("{}{}", self.endpoint, path))
            .header("X-aws-ec2-metadata-token-ttl-seconds", TOKEN_TTL_SECS.to_string())
            .send()
            .map_err(|source| ImdsError::Transport {
                path: path.into(),
                source,
            })?;
        read_body(path, response)
    }

    /// GET `/latest/meta-data/<path>`.
    pub fn get(&self, path: &str) -> Result<String, ImdsError> {
        let token = self.token()?;
        let full = format!("/latest/meta-data/{}", path.trim_start_matches('/'));
        debug!(path = %full, "querying instance metadata");
        let response = self
            .http
            .get(format!("{}{}", self.endpoint, full))
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .map_err(|source| ImdsError::Transport {
                path: full.clone(),
                source,
            })?;
        read_body(&full, response)
    }

    pub fn region(&self) -> Result<String, ImdsError> {
        self.get("placement/region")
    }

    pub fn role_credentials(&self) -> Result<RoleCredentials, ImdsError> {
        let listing = self.get("iam/security-credentials/")?;
        let role = listing
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| ImdsError::Parse {
                path: "iam/security-credentials/".into(),
                detail: "no instance profile role attached".into(),
            })?
            .to_string();

        let path = format!("iam/security-credentials/{}", role);
        let body = self.get(&path)?;
        serde_json::from_str(&body).map_err(|e| ImdsError::Parse {
            path,
            detail: e.to_string(),
        })
    }
}

impl InstanceIdentity for Imds {
    fn instance_id(&self) -> Result<String, ImdsError> {
        self.get("instance-id")
    }
}

fn read_body(path: &str, response: reqwest::blocking::Response) -> Result<String, ImdsError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ImdsError::Status {
            path: path.into(),
            status: status.as_u16(),
        });
    }
    let body = response.text().map_err(|source| ImdsError::Transport {
        path: path.into(),
        source,
    })?;
    Ok(body.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serves canned IMDS answers on a loopback port, one request per connection.
    fn fake_imds() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&buf).to_lowercase();
                let line = request.lines().next().unwrap_or_default().to_string();
                let authorized = request.contains("x-aws-ec2-metadata-token: tok");

                let (status, body) = if line.starts_with("put /latest/api/token") {
                    ("200 OK", "tok".to_string())
                } else if !authorized {
                    ("401 Unauthorized", String::new())
                } else if line.starts_with("get /latest/meta-data/instance-id ") {
                    ("200 OK", "i-0abc\n".to_string())
                } else if line.starts_with("get /latest/meta-data/iam/security-credentials/ ") {
                    ("200 OK", "shrink-role\n".to_string())
                } else if line.starts_with("get /latest/meta-data/iam/security-credentials/shrink-role ") {
                    (
                        "200 OK",
                        r#"{"Code":"Success","Type":"AWS-HMAC","AccessKeyId":"AKID",
                            "SecretAccessKey":"secret","Token":"session",
                            "Expiration":"2030-01-01T00:00:00Z"}"#
                            .to_string(),
                    )
                } else {
                    ("404 Not Found", String::new())
                };

                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        format!("http://{}", addr)
    }

    #[test]
    fn reads_instance_id_with_session_token() {
        let imds = Imds::with_endpoint(fake_imds()).unwrap();
        assert_eq!(imds.instance_id().unwrap(), "i-0abc");
    }

    #[test]
    fn reads_role_credentials() {
        let imds = Imds::with_endpoint(fake_imds()).unwrap();
        let creds = imds.role_credentials().unwrap();
        assert_eq!(creds.access_key_id, "AKID");
        assert_eq!(creds.token, "session");
        assert_eq!(creds.expiration, "2030-01-01T00:00:00Z");
    }

    #[test]
    fn missing_path_is_a_status_error() {
        let imds = Imds::with_endpoint(fake_imds()).unwrap();
        match imds.region() {
            Err(ImdsError::Status { status, .. }) => assert_eq!(status, 404),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}

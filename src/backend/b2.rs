//! Backblaze B2 backend.
//!
//! Uses the native B2 large-file API: `b2_authorize_account` (HTTP Basic)
//! yields a renewable token plus the API base URL and the server's part-size
//! recommendation; `b2_start_large_file` opens the upload;
//! `b2_get_upload_part_url` hands out a per-attempt URL/token pair; parts
//! are POSTed with their SHA-1; `b2_finish_large_file` closes the file from
//! the ordered SHA-1 array.

use super::{Backend, BackendError, Limits, PartSource};
use async_trait::async_trait;
use base64::Engine;
use reqwest::header::CONTENT_LENGTH;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

const AUTHORIZE_URL: &str = "https://api.backblazeb2.com/b2api/v2/b2_authorize_account";

/// B2 caps a large file at 10 000 parts of up to 5 GB and requires at least
/// two parts. The minimum part size comes from the authorize response.
const MAX_PARTS: u64 = 10_000;
const MIN_PARTS: u64 = 2;
const MAX_PART_SIZE: u64 = 5_000_000_000;

/// Configuration for the B2 backend.
#[derive(Debug, Clone)]
pub struct B2Options {
    pub account_id: String,
    pub application_key: String,
    pub bucket_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeResponse {
    authorization_token: String,
    api_url: String,
    recommended_part_size: u64,
    absolute_minimum_part_size: u64,
}

/// One authorization epoch. Replaced wholesale on renewal so concurrent
/// readers always see a consistent token/url pair.
#[derive(Debug)]
struct AuthState {
    token: String,
    api_url: String,
    recommended_part_size: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartLargeFileRequest<'a> {
    file_name: &'a str,
    bucket_id: &'a str,
    content_type: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartLargeFileResponse {
    file_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GetUploadPartUrlRequest<'a> {
    file_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetUploadPartUrlResponse {
    upload_url: String,
    authorization_token: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FinishLargeFileRequest<'a> {
    file_id: &'a str,
    part_sha1_array: Vec<String>,
}

/// B2 backend state: HTTP client, account options, and the renewable
/// authorization handle.
pub struct B2Backend {
    http: reqwest::Client,
    options: B2Options,
    limits: Limits,
    auth: RwLock<Arc<AuthState>>,
    /// Single-flight guard: only one renewal request at a time; late
    /// arrivals observe the refreshed state instead of re-authorizing.
    renewal: Mutex<()>,
}

impl B2Backend {
    /// Authenticate and capture the account's part-size limits.
    pub async fn connect(options: B2Options) -> Result<Self, BackendError> {
        if options.account_id.is_empty() || options.application_key.is_empty() {
            return Err(BackendError::Credentials(
                "B2 account id and application key are required (flags or B2_ACCOUNT_ID / B2_APPLICATION_KEY)"
                    .to_string(),
            ));
        }

        let http = super::http_client()?;
        let authorized = authorize(&http, &options).await?;
        let limits = Limits {
            min_parts: MIN_PARTS,
            max_parts: MAX_PARTS,
            min_part_size: authorized.absolute_minimum_part_size,
            max_part_size: MAX_PART_SIZE,
        };

        debug!(
            api_url = %authorized.api_url,
            recommended_part_size = authorized.recommended_part_size,
            "b2 account authorized"
        );

        Ok(Self {
            http,
            options,
            limits,
            auth: RwLock::new(Arc::new(AuthState {
                token: authorized.authorization_token,
                api_url: authorized.api_url,
                recommended_part_size: authorized.recommended_part_size,
            })),
            renewal: Mutex::new(()),
        })
    }

    /// Renew the authorization token, coalescing concurrent callers: the
    /// first performs the request while the rest wait on the guard and then
    /// adopt whatever it installed.
    async fn renew(&self, observed: &Arc<AuthState>) -> Result<Arc<AuthState>, BackendError> {
        let _guard = self.renewal.lock().await;
        let current = self.auth.read().await.clone();
        if !Arc::ptr_eq(&current, observed) {
            // Someone else renewed while we waited for the guard.
            return Ok(current);
        }

        warn!("b2 authorization expired, renewing");
        let authorized = authorize(&self.http, &self.options).await?;
        let fresh = Arc::new(AuthState {
            token: authorized.authorization_token,
            api_url: authorized.api_url,
            recommended_part_size: authorized.recommended_part_size,
        });
        *self.auth.write().await = fresh.clone();
        Ok(fresh)
    }

    async fn current_auth(&self) -> Arc<AuthState> {
        self.auth.read().await.clone()
    }
}

/// `GET b2_authorize_account` with HTTP Basic credentials. A 401 here means
/// the account credentials themselves are bad, which no retry will fix.
async fn authorize(
    http: &reqwest::Client,
    options: &B2Options,
) -> Result<AuthorizeResponse, BackendError> {
    let basic = base64::engine::general_purpose::STANDARD
        .encode(format!("{}:{}", options.account_id, options.application_key));

    let response = http
        .get(AUTHORIZE_URL)
        .header("Authorization", format!("Basic {}", basic))
        .send()
        .await?;

    if response.status() == StatusCode::UNAUTHORIZED {
        return Err(BackendError::Credentials(
            "B2 rejected the account credentials".to_string(),
        ));
    }
    if !response.status().is_success() {
        return Err(BackendError::from_response(response).await);
    }

    Ok(response.json().await?)
}

/// Prefer the server's recommendation when it fits the part budget;
/// otherwise spread the file evenly across the maximum part count.
fn pick_part_size(size: u64, recommended: u64) -> u64 {
    let recommended = recommended.max(1);
    if size.div_ceil(recommended) <= MAX_PARTS {
        recommended
    } else {
        size.div_ceil(MAX_PARTS)
    }
}

#[async_trait]
impl Backend for B2Backend {
    fn name(&self) -> &'static str {
        "b2"
    }

    fn limits(&self) -> Limits {
        self.limits
    }

    async fn ideal_part_size(&self, size: u64) -> Result<u64, BackendError> {
        let auth = self.current_auth().await;
        Ok(pick_part_size(size, auth.recommended_part_size))
    }

    #[instrument(skip(self))]
    async fn initiate(&self, name: &str, _part_size: u64) -> Result<String, BackendError> {
        let auth = self.current_auth().await;
        let response = self
            .http
            .post(format!("{}/b2api/v2/b2_start_large_file", auth.api_url))
            .header("Authorization", &auth.token)
            .json(&StartLargeFileRequest {
                file_name: name,
                bucket_id: &self.options.bucket_id,
                content_type: "application/octet-stream",
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::from_response(response).await);
        }

        let started: StartLargeFileResponse = response.json().await?;
        debug!(file_id = %started.file_id, "large file started");
        Ok(started.file_id)
    }

    #[instrument(skip(self, source), fields(part = source.part().index))]
    async fn upload_part(
        &self,
        upload_id: &str,
        source: &PartSource,
    ) -> Result<Vec<u8>, BackendError> {
        // Every attempt gets its own upload URL and token.
        let auth = self.current_auth().await;
        let response = self
            .http
            .post(format!("{}/b2api/v2/b2_get_upload_part_url", auth.api_url))
            .header("Authorization", &auth.token)
            .json(&GetUploadPartUrlRequest { file_id: upload_id })
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            // Kick off one renewal for the fleet, but still fail this
            // attempt; the scheduler re-enqueues the part and the retry
            // picks up the fresh token.
            let renewed = self.renew(&auth).await;
            let failure = BackendError::from_response(response).await;
            renewed?;
            return Err(failure);
        }
        if !response.status().is_success() {
            return Err(BackendError::from_response(response).await);
        }
        let upload: GetUploadPartUrlResponse = response.json().await?;

        // First pass over the range computes the SHA-1, second streams it
        // as the request body.
        let sha1 = source.sha1().await?;
        let sha1_hex = hex::encode(sha1);

        let response = self
            .http
            .post(&upload.upload_url)
            .header("Authorization", &upload.authorization_token)
            .header("X-Bz-Part-Number", source.part().index + 1)
            .header(CONTENT_LENGTH, source.len())
            .header("X-Bz-Content-Sha1", &sha1_hex)
            .body(source.body().await?)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::from_response(response).await);
        }

        Ok(sha1.to_vec())
    }

    #[instrument(skip(self, part_hashes))]
    async fn complete(
        &self,
        upload_id: &str,
        _size: u64,
        part_hashes: &[Vec<u8>],
    ) -> Result<(), BackendError> {
        let part_sha1_array = part_hashes.iter().map(hex::encode).collect::<Vec<_>>();

        let auth = self.current_auth().await;
        let response = self
            .http
            .post(format!("{}/b2api/v2/b2_finish_large_file", auth.api_url))
            .header("Authorization", &auth.token)
            .json(&FinishLargeFileRequest {
                file_id: upload_id,
                part_sha1_array,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(BackendError::from_response(response).await);
        }

        debug!(upload_id, "large file finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend with a canned auth state; the API URL is unroutable so any
    /// accidental network call fails loudly.
    fn backend_with_auth(token: &str) -> B2Backend {
        B2Backend {
            http: reqwest::Client::new(),
            options: B2Options {
                account_id: "acct".to_string(),
                application_key: "key".to_string(),
                bucket_id: "bucket".to_string(),
            },
            limits: Limits {
                min_parts: MIN_PARTS,
                max_parts: MAX_PARTS,
                min_part_size: 5_000_000,
                max_part_size: MAX_PART_SIZE,
            },
            auth: RwLock::new(Arc::new(AuthState {
                token: token.to_string(),
                api_url: "http://coldhaul.invalid".to_string(),
                recommended_part_size: 100_000_000,
            })),
            renewal: Mutex::new(()),
        }
    }

    #[tokio::test]
    async fn test_renew_with_stale_observation_adopts_current_state() {
        // A caller that observed the old epoch coalesces onto the renewal
        // someone else already performed: no second authorize round-trip.
        let backend = backend_with_auth("fresh-token");
        let stale = Arc::new(AuthState {
            token: "stale-token".to_string(),
            api_url: "http://coldhaul.invalid".to_string(),
            recommended_part_size: 100_000_000,
        });

        let adopted = backend.renew(&stale).await.unwrap();
        assert_eq!(adopted.token, "fresh-token");
    }

    #[test]
    fn test_pick_part_size_prefers_recommendation() {
        // 1 GiB at the typical 100 MB recommendation: 11 parts, well under
        // the budget.
        assert_eq!(pick_part_size(1 << 30, 100_000_000), 100_000_000);
    }

    #[test]
    fn test_pick_part_size_spreads_when_recommendation_overflows_budget() {
        // 10 TB at a 100 MB recommendation would need 100 000 parts; fall
        // back to an even spread over the maximum count.
        let size: u64 = 10_000_000_000_000;
        let picked = pick_part_size(size, 100_000_000);
        assert_eq!(picked, size.div_ceil(MAX_PARTS));
        assert!(size.div_ceil(picked) <= MAX_PARTS);
    }

    #[test]
    fn test_pick_part_size_guards_zero_recommendation() {
        assert_eq!(pick_part_size(1000, 0), 1);
    }

    #[test]
    fn test_authorize_response_shape() {
        let json = r#"{
            "accountId": "abc",
            "authorizationToken": "token123",
            "apiUrl": "https://api001.backblazeb2.com",
            "downloadUrl": "https://f001.backblazeb2.com",
            "recommendedPartSize": 100000000,
            "absoluteMinimumPartSize": 5000000
        }"#;
        let parsed: AuthorizeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.authorization_token, "token123");
        assert_eq!(parsed.api_url, "https://api001.backblazeb2.com");
        assert_eq!(parsed.recommended_part_size, 100_000_000);
        assert_eq!(parsed.absolute_minimum_part_size, 5_000_000);
    }

    #[test]
    fn test_finish_request_shape() {
        let body = serde_json::to_value(FinishLargeFileRequest {
            file_id: "f1",
            part_sha1_array: vec!["aa".to_string(), "bb".to_string()],
        })
        .unwrap();
        assert_eq!(body["fileId"], "f1");
        assert_eq!(body["partSha1Array"][1], "bb");
    }
}

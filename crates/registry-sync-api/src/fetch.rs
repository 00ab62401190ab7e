//! Record sources: the remote notice registry over HTTP, or an NDJSON file.

use std::io::Read;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose, Engine as _};
use registry_sync_core::{ArrestWarrantRow, Decimal, LanguageRow, NationalityRow, PictureRow, RemoteRecord};
use serde::Deserialize;
use serde_json::Value;

use crate::config::SyncConfig;
use crate::retry::{FetchError, Retrier};

/// Stored as the thumbnail when a notice links none.
pub const PLACEHOLDER_THUMBNAIL: &str = "iVBORw0KGgoAAAANSUhEUgAAAKoAAACqAgMAAABAGDwRAAAADFBMVEWutLfk5ufb3d/EyMpaqx/2AAACUUlEQVRYw+3YK3LcQBAA0LZUBgJKkI8gHiLgoD3CAu1IVREQ3wU6gi6xPNQh2QMEzA2CdASDsFCTOJWsVur5dPeM7VTsKgm/mur5dfcIdsHfFla72tWudrVv0359/BFqTwDwEGYP8Oe7D7FK/7XvQux5WM/AHqsnm8u2mSikR9H2FwuFaPVsc8nWM4VUsu1iYRRsj2wpWI1sxluFKCS8rbBNeYunZk/Otp1hC9ZuDFuyVhs2Y61B4YqztWkTzlamTTnbmBaOjG0tOzJ2a9kbxnaWLRjbR9iNZcsIe83Y4Rk2Y6y2bP4fLLyxcV+jzV7oPMScs5iz3j/DFhH3+CYiP4wReecYnvsgIqeyeVJF5GrrQOSsHSLqRR9Rhzp6Kxzb0Mvr2DqiHu/oZXDtQJ10j+3I0u3ahpyaaxXZlnj6s4EK12MPVMvlsTXVyvn61NNkbwNsS7Sp3h785B/Wa/f+Yf3vgL2G98fQ94W6+xfvlv3jB/j+KyRe9W1aswfRqp/zHn8ULKLOEtv2ZNzN+114nkyZPKki6ttnu3YbURi2dqjxMjNs71o8MLbKQ3HE2B58Fl18bLXX3vrsJy9FWQLZzm+Xq4+sJmzm2oagSxCLpUJYgljsQNrStoqk83bMtqFtals63Dng2Q6MLS3L0EvAF1txNjFty1kwbcfa0bADawvDatZm2CqWTgsx2Yq3CbYNb1Nst7w9X9DJdoIdkd0ItkB2EGyJrBbsNbICPW/G2SrJ5outJXv1NFtJNllsI9n0abZ9SQtofb9I3/pPd7Wv0v4Gki3y31ZD0i8AAAAASUVORK5CYII=";

const MAX_BINARY_BYTES: u64 = 16 * 1024 * 1024;

/// A source document that could not be turned into a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub reference: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchedPage {
    pub page: u32,
    pub records: Vec<RemoteRecord>,
    pub rejected: Vec<RejectedRecord>,
    pub is_last: bool,
}

/// Lazy, paginated supply of remote records for one nationality.
pub trait RecordSource {
    /// Fetch page `page` (1-based). `None` means the listing is exhausted.
    ///
    /// # Errors
    /// Returns a `FetchError` when the page as a whole cannot be retrieved;
    /// individual missing or undecodable documents are reported in
    /// `FetchedPage::rejected`.
    fn fetch_page(&mut self, nationality: &str, page: u32) -> Result<Option<FetchedPage>, FetchError>;
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
}

#[derive(Debug, Default, Deserialize)]
struct NoticeLinks {
    #[serde(rename = "self")]
    self_link: Option<Link>,
    thumbnail: Option<Link>,
    images: Option<Link>,
}

#[derive(Debug, Deserialize)]
struct NoticeSummary {
    #[serde(rename = "_links", default)]
    links: NoticeLinks,
}

#[derive(Debug, Default, Deserialize)]
struct NoticeListingEmbedded {
    #[serde(default)]
    notices: Vec<NoticeSummary>,
}

#[derive(Debug, Deserialize)]
struct NoticeListing {
    #[serde(default)]
    total: Option<u64>,
    #[serde(rename = "_embedded", default)]
    embedded: NoticeListingEmbedded,
}

#[derive(Debug, Deserialize)]
struct NoticeDetail {
    entity_id: String,
    #[serde(default)]
    forename: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    sex_id: Option<String>,
    #[serde(default)]
    date_of_birth: Option<String>,
    #[serde(default)]
    place_of_birth: Option<String>,
    #[serde(default)]
    country_of_birth_id: Option<String>,
    #[serde(default)]
    weight: Option<Decimal>,
    #[serde(default)]
    height: Option<Decimal>,
    #[serde(default)]
    distinguishing_marks: Option<String>,
    #[serde(default)]
    eyes_colors_id: Option<Vec<String>>,
    #[serde(default)]
    hairs_id: Option<Vec<String>>,
    #[serde(default)]
    languages_spoken_ids: Option<Vec<String>>,
    #[serde(default)]
    nationalities: Option<Vec<String>>,
    #[serde(default)]
    arrest_warrants: Option<Vec<ArrestWarrantRow>>,
}

#[derive(Debug, Deserialize)]
struct ImageRef {
    picture_id: Value,
    #[serde(rename = "_links")]
    links: NoticeLinks,
}

#[derive(Debug, Default, Deserialize)]
struct ImageListingEmbedded {
    #[serde(default)]
    images: Option<Vec<ImageRef>>,
}

#[derive(Debug, Deserialize)]
struct ImageListing {
    #[serde(rename = "_embedded", default)]
    embedded: ImageListingEmbedded,
}

fn decode_error(err: impl std::fmt::Display) -> FetchError {
    FetchError::Decode(err.to_string())
}

fn picture_id(raw: &Value) -> Result<i64, FetchError> {
    match raw {
        Value::Number(number) => number
            .as_i64()
            .ok_or_else(|| FetchError::Decode(format!("picture_id {number} is not an integer"))),
        Value::String(text) => text
            .trim()
            .parse::<i64>()
            .map_err(|_| FetchError::Decode(format!("picture_id {text:?} is not an integer"))),
        other => Err(FetchError::Decode(format!("picture_id has unexpected type: {other}"))),
    }
}

/// Map a notice detail document to a [`RemoteRecord`].
///
/// `thumbnail` is the already-encoded thumbnail (or the placeholder) and
/// `pictures` the already-downloaded image rows, `None` when the source
/// reported no image list.
///
/// # Errors
/// Returns `FetchError::Decode` when the document lacks a usable `entity_id`
/// or a field has the wrong shape.
pub fn normalize_notice(
    detail: Value,
    thumbnail: String,
    pictures: Option<Vec<PictureRow>>,
) -> Result<RemoteRecord, FetchError> {
    let detail: NoticeDetail = serde_json::from_value(detail).map_err(decode_error)?;
    if detail.entity_id.trim().is_empty() {
        return Err(FetchError::Decode("notice has an empty entity_id".to_string()));
    }

    let mut record = RemoteRecord::new(detail.entity_id);
    record.forename = detail.forename;
    record.name = detail.name;
    record.sex_id = detail.sex_id;
    record.date_of_birth = detail.date_of_birth;
    record.place_of_birth = detail.place_of_birth;
    record.country_of_birth_id = detail.country_of_birth_id;
    record.weight = detail.weight;
    record.height = detail.height;
    record.distinguishing_marks = detail.distinguishing_marks;
    record.eyes_colors_id = detail.eyes_colors_id.and_then(|codes| codes.into_iter().next());
    record.hairs_id = detail.hairs_id.and_then(|codes| codes.into_iter().next());
    record.is_active = true;
    record.thumbnail = Some(thumbnail);
    record.languages_spoken_ids = detail.languages_spoken_ids.map(|codes| {
        codes.into_iter().map(|code| LanguageRow { languages_spoken_id: Some(code) }).collect()
    });
    record.nationalities = detail.nationalities.map(|codes| {
        codes.into_iter().map(|code| NationalityRow { nationality: Some(code) }).collect()
    });
    record.arrest_warrants = detail.arrest_warrants;
    record.pictures = pictures;
    Ok(record)
}

/// Client for the notice registry's listing, detail and image endpoints.
pub struct HttpRecordSource {
    agent: ureq::Agent,
    base_url: String,
    page_size: u32,
    retrier: Retrier,
}

impl HttpRecordSource {
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.request_timeout).build();
        Self {
            agent,
            base_url: config.source_url.clone(),
            page_size: config.page_size,
            retrier: Retrier::new(config.retry, config.breaker),
        }
    }

    fn get_json(&mut self, url: &str, query: &[(&str, String)]) -> Result<Value, FetchError> {
        let agent = &self.agent;
        self.retrier.call(url, || {
            send(agent, url, query)?
                .into_json::<Value>()
                .map_err(|err| FetchError::Decode(format!("invalid JSON from {url}: {err}")))
        })
    }

    fn get_base64(&mut self, url: &str) -> Result<String, FetchError> {
        let agent = &self.agent;
        let bytes = self.retrier.call(url, || {
            let mut buffer = Vec::new();
            send(agent, url, &[])?
                .into_reader()
                .take(MAX_BINARY_BYTES)
                .read_to_end(&mut buffer)
                .map_err(|err| FetchError::Transient(format!("failed to read {url}: {err}")))?;
            Ok(buffer)
        })?;
        Ok(general_purpose::STANDARD.encode(bytes))
    }

    fn fetch_pictures(&mut self, images_url: &str) -> Result<Option<Vec<PictureRow>>, FetchError> {
        let listing: ImageListing =
            serde_json::from_value(self.get_json(images_url, &[])?).map_err(decode_error)?;
        let Some(images) = listing.embedded.images else {
            return Ok(None);
        };

        let mut pictures = Vec::with_capacity(images.len());
        for image in images {
            let picture_id = picture_id(&image.picture_id)?;
            let Some(link) = image.links.self_link else {
                return Err(FetchError::Decode(format!("picture {picture_id} has no self link")));
            };
            let picture_base64 = match self.get_base64(&link.href) {
                Ok(encoded) => encoded,
                Err(err) if !err.aborts_cycle() => {
                    tracing::warn!(url = %link.href, picture_id, error = %err, "dropping unreadable picture");
                    continue;
                }
                Err(err) => return Err(err),
            };
            pictures.push(PictureRow {
                picture_id,
                picture_url: Some(link.href),
                picture_base64: Some(picture_base64),
            });
        }
        Ok(Some(pictures))
    }

    fn fetch_notice(&mut self, detail_url: &str) -> Result<RemoteRecord, FetchError> {
        let detail = self.get_json(detail_url, &[])?;
        let links: NoticeLinks = detail
            .get("_links")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(decode_error)?
            .unwrap_or_default();

        let thumbnail = match &links.thumbnail {
            Some(link) => match self.get_base64(&link.href) {
                Ok(encoded) => encoded,
                Err(err) if !err.aborts_cycle() => {
                    tracing::warn!(url = %link.href, error = %err, "thumbnail unavailable; using placeholder");
                    PLACEHOLDER_THUMBNAIL.to_string()
                }
                Err(err) => return Err(err),
            },
            None => PLACEHOLDER_THUMBNAIL.to_string(),
        };
        let pictures = match &links.images {
            Some(link) => self.fetch_pictures(&link.href)?,
            None => None,
        };

        normalize_notice(detail, thumbnail, pictures)
    }
}

fn send(agent: &ureq::Agent, url: &str, query: &[(&str, String)]) -> Result<ureq::Response, FetchError> {
    let mut request = agent.get(url);
    for (key, value) in query {
        request = request.query(key, value);
    }

    match request.call() {
        Ok(response) => Ok(response),
        Err(ureq::Error::Status(status, _)) => Err(FetchError::Http { status, url: url.to_string() }),
        Err(ureq::Error::Transport(transport)) => Err(FetchError::Transient(transport.to_string())),
    }
}

impl RecordSource for HttpRecordSource {
    fn fetch_page(&mut self, nationality: &str, page: u32) -> Result<Option<FetchedPage>, FetchError> {
        let base_url = self.base_url.clone();
        let query = [
            ("nationality", nationality.to_string()),
            ("resultPerPage", self.page_size.to_string()),
            ("page", page.to_string()),
        ];
        let listing: NoticeListing =
            serde_json::from_value(self.get_json(&base_url, &query)?).map_err(decode_error)?;

        let notices = listing.embedded.notices;
        if notices.is_empty() {
            return Ok(None);
        }

        let page_size = u64::from(self.page_size);
        let is_last = (notices.len() as u64) < page_size
            || listing.total.is_some_and(|total| u64::from(page) * page_size >= total);
        let mut fetched = FetchedPage { page, is_last, ..FetchedPage::default() };

        for notice in notices {
            let Some(link) = notice.links.self_link else {
                fetched.rejected.push(RejectedRecord {
                    reference: format!("{base_url}?page={page}"),
                    reason: "notice has no self link".to_string(),
                });
                continue;
            };
            match self.fetch_notice(&link.href) {
                Ok(record) => fetched.records.push(record),
                Err(err) if !err.aborts_cycle() => {
                    let reason = err.to_string();
                    tracing::warn!(url = %link.href, %reason, "skipping unusable notice");
                    fetched.rejected.push(RejectedRecord { reference: link.href, reason });
                }
                Err(err) => return Err(err),
            }
        }

        tracing::debug!(
            page,
            records = fetched.records.len(),
            rejected = fetched.rejected.len(),
            "fetched notice page"
        );
        Ok(Some(fetched))
    }
}

/// Newline-delimited JSON records, one [`RemoteRecord`] per line.
#[derive(Debug, Clone)]
pub struct FileRecordSource {
    path: PathBuf,
    page_size: usize,
    lines: Option<Vec<(usize, String)>>,
}

impl FileRecordSource {
    #[must_use]
    pub fn new(path: &Path, page_size: u32) -> Self {
        Self {
            path: path.to_path_buf(),
            page_size: usize::try_from(page_size.max(1)).unwrap_or(usize::MAX),
            lines: None,
        }
    }

    fn load(&mut self) -> Result<&[(usize, String)], FetchError> {
        if self.lines.is_none() {
            let raw = std::fs::read_to_string(&self.path).map_err(|err| {
                FetchError::Transient(format!("failed to read {}: {err}", self.path.display()))
            })?;
            let lines = raw
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(index, line)| (index + 1, line.to_string()))
                .collect();
            self.lines = Some(lines);
        }
        Ok(self.lines.as_deref().unwrap_or_default())
    }
}

impl RecordSource for FileRecordSource {
    fn fetch_page(&mut self, _nationality: &str, page: u32) -> Result<Option<FetchedPage>, FetchError> {
        // Re-read on every first page so each cycle sees the current file.
        if page <= 1 {
            self.lines = None;
        }
        let page_size = self.page_size;
        let path = self.path.display().to_string();
        let lines = self.load()?;

        let start = usize::try_from(page.max(1) - 1).unwrap_or(usize::MAX).saturating_mul(page_size);
        if start >= lines.len() {
            return Ok(None);
        }
        let end = start.saturating_add(page_size).min(lines.len());

        let mut fetched = FetchedPage { page, is_last: end == lines.len(), ..FetchedPage::default() };
        for (line_no, line) in &lines[start..end] {
            match serde_json::from_str::<RemoteRecord>(line) {
                Ok(record) => fetched.records.push(record),
                Err(err) => fetched.rejected.push(RejectedRecord {
                    reference: format!("{path}:{line_no}"),
                    reason: err.to_string(),
                }),
            }
        }
        Ok(Some(fetched))
    }
}

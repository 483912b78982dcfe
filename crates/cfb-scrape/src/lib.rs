//! Measure-site crawler: polite sequential fetching + HTML extraction.
//!
//! The extraction functions are pure so they can be exercised offline
//! against captured markup; only [`scrape_measures`] touches the network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::NaiveDate;
use regex::Regex;
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{debug, info};

use cfb_core::{normalize_election_kind, ScrapedCommitteeRef, ScrapedElection, ScrapedProposition};

/// Listing page for a recent session. Older sessions stay reachable through
/// the links on this page, so one entry point covers the full history.
pub const MEASURES_INDEX_PATH: &str = "Campaign/Measures/list.aspx?session=2013";

#[derive(Debug, Clone)]
pub struct ScrapeConfig {
    pub base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    /// Total fetch attempts per page before the scrape aborts.
    pub retries: usize,
    pub retry_delay: Duration,
    /// Pause between consecutive requests. Politeness toward the source
    /// site, not a tunable for throughput.
    pub request_delay: Duration,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://cal-access.sos.ca.gov/".to_string(),
            user_agent: "cfb-bot/0.1".to_string(),
            timeout: Duration::from_secs(20),
            retries: 3,
            retry_delay: Duration::from_secs(2),
            request_delay: Duration::from_millis(500),
        }
    }
}

impl ScrapeConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let request_delay_ms = std::env::var("CFB_SCRAPE_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500u64)
            // Keep the crawl polite no matter what the environment says.
            .max(500);
        Self {
            base_url: std::env::var("CFB_SCRAPE_BASE_URL").unwrap_or(defaults.base_url),
            user_agent: std::env::var("CFB_USER_AGENT").unwrap_or(defaults.user_agent),
            timeout: std::env::var("CFB_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            retries: std::env::var("CFB_SCRAPE_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.retries),
            retry_delay: std::env::var("CFB_SCRAPE_RETRY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            request_delay: Duration::from_millis(request_delay_ms),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error("page structure changed: {0}")]
    Structure(String),
}

/// Sequential page fetcher with a fixed retry budget and an inter-request
/// pause. All non-success statuses are retried alike; the exhaustion error
/// aborts the whole scrape.
pub struct Fetcher {
    client: reqwest::Client,
    base_url: String,
    retries: usize,
    retry_delay: Duration,
    request_delay: Duration,
    started: AtomicBool,
}

impl Fetcher {
    pub fn new(config: &ScrapeConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retries: config.retries.max(1),
            retry_delay: config.retry_delay,
            request_delay: config.request_delay,
            started: AtomicBool::new(false),
        })
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn fetch_text(&self, path: &str) -> Result<String, FetchError> {
        if self.started.swap(true, Ordering::Relaxed) {
            tokio::time::sleep(self.request_delay).await;
        }

        let url = self.url_for(path);
        for attempt in 1..=self.retries {
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.text().await?);
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.retries {
                        debug!(%url, status, attempt, "fetch failed, retrying");
                        tokio::time::sleep(self.retry_delay).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus { status, url });
                }
                Err(err) => {
                    if attempt < self.retries {
                        debug!(%url, error = %err, attempt, "fetch failed, retrying");
                        tokio::time::sleep(self.retry_delay).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
        unreachable!("retry loop always returns on its final attempt")
    }
}

/// One dated election table on a measures listing page, before its measure
/// pages have been fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionBlock {
    pub date: NaiveDate,
    pub kind: String,
    pub measure_links: Vec<String>,
}

fn selector(css: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(css).map_err(|e| ScrapeError::Selector(e.to_string()))
}

fn element_text(element: scraper::ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Collect measure-listing links from the index page. Set semantics: the
/// same session shows up under several anchors and order carries no meaning.
pub fn extract_session_links(html: &str) -> Result<Vec<String>, ScrapeError> {
    let session_re = Regex::new(r"\?session=\d+").expect("static pattern");
    let anchors = selector("a[href]")?;

    let document = Html::parse_document(html);
    let mut links: Vec<String> = document
        .select(&anchors)
        .filter_map(|a| a.value().attr("href"))
        .filter(|href| session_re.is_match(href))
        .map(ToString::to_string)
        .collect();
    links.sort();
    links.dedup();
    Ok(links)
}

/// Parse every election table on a measures listing page. The caption text
/// leads with a `MONTH DAY, YEAR` token; the remainder is the free-text
/// election type.
pub fn extract_election_blocks(html: &str, page: &str) -> Result<Vec<ElectionBlock>, ScrapeError> {
    let table_id_re = Regex::new(r"ListElections1__[a-z0-9]+").expect("static pattern");
    let date_re = Regex::new(r"^[A-Z]+ \d{1,2}, \d{4}").expect("static pattern");
    let tables = selector("table[id]")?;
    let caption = selector("caption span")?;
    let anchors = selector("a[href]")?;

    let document = Html::parse_document(html);
    let mut blocks = Vec::new();
    for table in document.select(&tables) {
        let id = table.value().attr("id").unwrap_or_default();
        if !table_id_re.is_match(id) {
            continue;
        }

        let title = table
            .select(&caption)
            .next()
            .map(element_text)
            .ok_or_else(|| {
                ScrapeError::Structure(format!("election table {id} on {page} has no caption"))
            })?;
        let date_token = date_re.find(&title).ok_or_else(|| {
            ScrapeError::Structure(format!("no date in election title {title:?} on {page}"))
        })?;
        let date = NaiveDate::parse_from_str(date_token.as_str(), "%B %d, %Y").map_err(|e| {
            ScrapeError::Structure(format!("bad election date {:?}: {e}", date_token.as_str()))
        })?;
        let kind = normalize_election_kind(&title[date_token.end()..]);

        let measure_links = table
            .select(&anchors)
            .filter_map(|a| a.value().attr("href"))
            .map(ToString::to_string)
            .collect();

        blocks.push(ElectionBlock {
            date,
            kind,
            measure_links,
        });
    }
    Ok(blocks)
}

/// Parse a single measure page: the measure name, the numeric id embedded in
/// the page's own URL, and every supporting/opposing committee block.
pub fn extract_measure(html: &str, page_url: &str) -> Result<ScrapedProposition, ScrapeError> {
    let id_re = Regex::new(r"id=(\d+)").expect("static pattern");
    let name_span = selector("span#measureName")?;
    let committee_tables = selector(r#"table[cellpadding="4"]"#)?;
    let committee_link = selector("a.sublink2")?;
    let data_spans = selector("span.txt7")?;

    let external_id = id_re
        .captures_iter(page_url)
        .last()
        .map(|c| c[1].to_string())
        .ok_or_else(|| ScrapeError::Structure(format!("no measure id in url {page_url}")))?;

    let document = Html::parse_document(html);
    let name = document
        .select(&name_span)
        .next()
        .map(element_text)
        .ok_or_else(|| ScrapeError::Structure(format!("no measure name on {page_url}")))?;

    let mut committees = Vec::new();
    for table in document.select(&committee_tables) {
        let committee_name = table
            .select(&committee_link)
            .next()
            .map(element_text)
            .ok_or_else(|| {
                ScrapeError::Structure(format!("committee block without a name link on {page_url}"))
            })?;
        let data: Vec<String> = table.select(&data_spans).map(element_text).collect();
        let [committee_id, position_text, ..] = data.as_slice() else {
            return Err(ScrapeError::Structure(format!(
                "committee block for {committee_name:?} on {page_url} is missing its data spans"
            )));
        };
        // Anything that is not the literal SUPPORT marker counts as oppose.
        let supports = position_text.as_str() == "SUPPORT";
        committees.push(ScrapedCommitteeRef {
            name: committee_name,
            external_id: committee_id.clone(),
            supports,
        });
    }

    Ok(ScrapedProposition {
        external_id,
        name,
        committees,
    })
}

/// Crawl the measures site: index page, then every session listing, then
/// every measure page, one request at a time.
pub async fn scrape_measures(fetcher: &Fetcher) -> Result<Vec<ScrapedElection>, ScrapeError> {
    let index = fetcher.fetch_text(MEASURES_INDEX_PATH).await?;
    let links = extract_session_links(&index)?;
    info!(listings = links.len(), "scraping measure listings");

    let mut elections = Vec::new();
    for link in &links {
        debug!(%link, "scraping session listing");
        let listing = fetcher.fetch_text(link).await?;
        for block in extract_election_blocks(&listing, link)? {
            let mut propositions = Vec::new();
            for measure_link in &block.measure_links {
                debug!(%measure_link, "scraping measure");
                let measure = fetcher.fetch_text(measure_link).await?;
                propositions.push(extract_measure(&measure, measure_link)?);
            }
            info!(
                date = %block.date,
                kind = %block.kind,
                measures = propositions.len(),
                "scraped election block"
            );
            elections.push(ScrapedElection {
                date: block.date,
                kind: block.kind,
                propositions,
            });
        }
    }
    Ok(elections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn session_links_are_filtered_and_deduplicated() {
        let html = r#"
            <html><body>
            <a href="/Campaign/Measures/list.aspx?session=2013">2013</a>
            <a href="/Campaign/Measures/list.aspx?session=2011">2011</a>
            <a href="/Campaign/Measures/list.aspx?session=2013">2013 again</a>
            <a href="/Campaign/Candidates/list.aspx">candidates</a>
            <a href="/Campaign/Measures/list.aspx?session=">broken</a>
            </body></html>
        "#;
        let links = extract_session_links(html).unwrap();
        assert_eq!(
            links,
            vec![
                "/Campaign/Measures/list.aspx?session=2011".to_string(),
                "/Campaign/Measures/list.aspx?session=2013".to_string(),
            ]
        );
    }

    #[test]
    fn election_blocks_split_date_and_type_from_the_caption() {
        let html = r#"
            <html><body>
            <table id="ListElections1__a1b2">
              <caption><span>JUNE 3, 2014 PRIMARY ELECTION</span></caption>
              <tr><td><a href="/Campaign/Measures/Detail.aspx?id=1379&session=2013">Prop 41</a></td></tr>
              <tr><td><a href="/Campaign/Measures/Detail.aspx?id=1380&session=2013">Prop 42</a></td></tr>
            </table>
            <table id="unrelated">
              <caption><span>NOT AN ELECTION</span></caption>
            </table>
            </body></html>
        "#;
        let blocks = extract_election_blocks(html, "list.aspx?session=2013").unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].date, NaiveDate::from_ymd_opt(2014, 6, 3).unwrap());
        assert_eq!(blocks[0].kind, "PRIMARY");
        assert_eq!(blocks[0].measure_links.len(), 2);
    }

    #[test]
    fn election_block_without_a_date_is_a_structure_error() {
        let html = r#"
            <table id="ListElections1__ff00">
              <caption><span>SOMETIME SOON PRIMARY</span></caption>
            </table>
        "#;
        let err = extract_election_blocks(html, "list.aspx?session=2013").unwrap_err();
        assert!(matches!(err, ScrapeError::Structure(_)));
    }

    #[test]
    fn measure_page_yields_name_id_and_committee_positions() {
        let html = r#"
            <html><body>
            <span id="measureName">PROPOSITION 041 VETERANS HOUSING</span>
            <table cellpadding="4">
              <tr><td><a class="sublink2">YES ON 41 COMMITTEE</a></td></tr>
              <tr><td><span class="txt7">1363810</span></td>
                  <td><span class="txt7"> SUPPORT </span></td></tr>
            </table>
            <table cellpadding="4">
              <tr><td><a class="sublink2">TAXPAYERS AGAINST 41</a></td></tr>
              <tr><td><span class="txt7">1363811</span></td>
                  <td><span class="txt7">OPPOSE</span></td></tr>
            </table>
            </body></html>
        "#;
        let prop =
            extract_measure(html, "/Campaign/Measures/Detail.aspx?id=1379&session=2013").unwrap();
        assert_eq!(prop.external_id, "1379");
        assert_eq!(prop.name, "PROPOSITION 041 VETERANS HOUSING");
        assert_eq!(
            prop.committees,
            vec![
                ScrapedCommitteeRef {
                    name: "YES ON 41 COMMITTEE".to_string(),
                    external_id: "1363810".to_string(),
                    supports: true,
                },
                ScrapedCommitteeRef {
                    name: "TAXPAYERS AGAINST 41".to_string(),
                    external_id: "1363811".to_string(),
                    supports: false,
                },
            ]
        );
    }

    #[test]
    fn only_the_exact_support_marker_counts_as_support() {
        let html = r#"
            <span id="measureName">PROPOSITION 099</span>
            <table cellpadding="4">
              <tr><td><a class="sublink2">COMMITTEE A</a></td></tr>
              <tr><td><span class="txt7">42</span></td>
                  <td><span class="txt7">Support</span></td></tr>
            </table>
        "#;
        let prop = extract_measure(html, "Detail.aspx?id=7").unwrap();
        assert!(!prop.committees[0].supports);
    }

    #[test]
    fn measure_page_without_a_name_is_a_structure_error() {
        let err = extract_measure("<html></html>", "Detail.aspx?id=7").unwrap_err();
        assert!(matches!(err, ScrapeError::Structure(_)));
    }

    async fn spawn_failing_server(hits: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(
                        b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn fetch_exhausts_its_retry_budget_then_fails_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base_url = spawn_failing_server(hits.clone()).await;
        let fetcher = Fetcher::new(&ScrapeConfig {
            base_url,
            retries: 3,
            retry_delay: Duration::from_millis(1),
            request_delay: Duration::ZERO,
            ..ScrapeConfig::default()
        })
        .unwrap();

        let err = fetcher.fetch_text("anything.aspx").await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}

use super::{check_status, Error, SourceHost};

use tally_types::records::PullRequestInfo;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::{HeaderMap, LINK};
use serde::Deserialize;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use std::time::Duration;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

lazy_static! {
    static ref NEXT_LINK: Regex = Regex::new(r#"<([^>]+)>;\s*rel="next""#).unwrap();
}

#[derive(Clone, Debug)]
pub struct GithubClient {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(token: Option<String>) -> Result<Self, Error> {
        Self::with_api_url(DEFAULT_API_URL, token)
    }

    pub fn with_api_url(api_url: &str, token: Option<String>) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("tally/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| Error::BadResponse(e.to_string()))?;
        Ok(GithubClient {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.request_url(method, &format!("{}{}", self.api_url, path))
    }

    fn request_url(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Pull {
    number: u64,
    title: String,
    html_url: String,
    merged_at: Option<String>,
    head: Head,
}

#[derive(Debug, Deserialize)]
struct Head {
    sha: String,
}

/// The `rel="next"` target of a paginated response.
fn next_link(headers: &HeaderMap) -> Option<String> {
    let link = headers.get(LINK)?.to_str().ok()?;
    NEXT_LINK.captures(link).map(|captures| captures[1].to_string())
}

fn info(pull: Pull) -> Result<PullRequestInfo, Error> {
    let merged_at = pull
        .merged_at
        .map(|merged_at| OffsetDateTime::parse(&merged_at, &Rfc3339))
        .transpose()
        .map_err(|e| Error::BadResponse(format!("pull request {}: {}", pull.number, e)))?;
    Ok(PullRequestInfo {
        number: pull.number,
        title: pull.title,
        url: pull.html_url,
        sha: pull.head.sha,
        merged_at,
    })
}

#[async_trait]
impl SourceHost for GithubClient {
    async fn list_pull_requests(&self, repo: &str) -> Result<Vec<PullRequestInfo>, Error> {
        let path = format!("/repos/{}/pulls?state=all&per_page=100&sort=updated&direction=desc", repo);
        let mut response = check_status(self.request(reqwest::Method::GET, &path).send().await?).await?;
        let mut pulls = Vec::new();
        loop {
            let next = next_link(response.headers());
            let page: Vec<Pull> = response.json().await?;
            pulls.extend(page);
            let Some(next) = next else {
                break;
            };
            response = check_status(self.request_url(reqwest::Method::GET, &next).send().await?).await?;
        }
        tracing::trace!("source host listed {} pull request(s) for {}", pulls.len(), repo);
        pulls.into_iter().map(info).collect()
    }

    async fn post_comment(&self, repo: &str, number: u64, text: &str) -> Result<(), Error> {
        let path = format!("/repos/{}/issues/{}/comments", repo, number);
        let response = self
            .request(reqwest::Method::POST, &path)
            .json(&json!({ "body": text }))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_pull_requests() {
        let pulls: Vec<Pull> = serde_json::from_value(json!([
            {
                "number": 7,
                "title": "Bump the installer",
                "html_url": "https://github.com/openshift/installer/pull/7",
                "merged_at": "2023-10-11T04:53:20Z",
                "head": { "sha": "abc123" }
            },
            {
                "number": 8,
                "title": "Still open",
                "html_url": "https://github.com/openshift/installer/pull/8",
                "merged_at": null,
                "head": { "sha": "def456" }
            }
        ]))
        .unwrap();
        let infos: Vec<PullRequestInfo> = pulls.into_iter().map(info).collect::<Result<_, _>>().unwrap();
        assert_eq!(infos[0].merged_at.map(|t| t.unix_timestamp()), Some(1_697_000_000));
        assert_eq!(infos[0].sha, "abc123");
        assert_eq!(infos[1].merged_at, None);
    }

    #[test]
    fn follows_the_next_link() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            r#"<https://api.github.com/repositories/1/pulls?page=1>; rel="prev", <https://api.github.com/repositories/1/pulls?page=3>; rel="next", <https://api.github.com/repositories/1/pulls?page=9>; rel="last""#
                .parse()
                .unwrap(),
        );
        assert_eq!(
            next_link(&headers).as_deref(),
            Some("https://api.github.com/repositories/1/pulls?page=3")
        );

        headers.insert(
            LINK,
            r#"<https://api.github.com/repositories/1/pulls?page=8>; rel="prev""#.parse().unwrap(),
        );
        assert_eq!(next_link(&headers), None);
        assert_eq!(next_link(&HeaderMap::new()), None);
    }
}

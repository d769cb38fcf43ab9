use crate::connectors::SourceHost;
use crate::context::Context;

use tally_types::artifacts::PullRequestRef;

use tokio::task::JoinSet;

use std::sync::Arc;

/// Failed tests listed in one comment before the rest is summarized.
const LISTED_TESTS: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommentRequest {
    pub repo: String,
    pub number: u64,
    pub text: String,
}

/// Tells pull-request authors about failing runs that tested their change.
#[derive(Clone)]
pub struct Commenter {
    host: Arc<dyn SourceHost>,
    include: Vec<String>,
    exclude: Vec<String>,
}

impl Commenter {
    /// An empty `include` list allows every repository not excluded.
    pub fn new(host: Arc<dyn SourceHost>, include: Vec<String>, exclude: Vec<String>) -> Self {
        Commenter { host, include, exclude }
    }

    pub fn allows(&self, repo: &str) -> bool {
        !self.exclude.iter().any(|r| r == repo) && (self.include.is_empty() || self.include.iter().any(|r| r == repo))
    }

    pub fn request_for(
        &self,
        job: &str,
        run_id: &str,
        url: Option<&str>,
        failed_tests: &[String],
        pull_request: &PullRequestRef,
    ) -> Option<CommentRequest> {
        let repo = pull_request.slug();
        if !self.allows(&repo) {
            return None;
        }
        let mut text = match url {
            Some(url) => format!("Job `{}` failed in [run {}]({}).", job, run_id, url),
            None => format!("Job `{}` failed in run {}.", job, run_id),
        };
        if !failed_tests.is_empty() {
            text.push_str(&format!("\n\nFailed tests ({}):\n", failed_tests.len()));
            for test in failed_tests.iter().take(LISTED_TESTS) {
                text.push_str(&format!("- `{}`\n", test));
            }
            if failed_tests.len() > LISTED_TESTS {
                text.push_str(&format!("- ... and {} more\n", failed_tests.len() - LISTED_TESTS));
            }
        }
        Some(CommentRequest {
            repo,
            number: pull_request.number,
            text,
        })
    }

    /// Posts every request concurrently. Failures are logged and never
    /// propagate; whatever is still in flight at the deadline is dropped.
    /// Returns how many comments were posted.
    pub async fn post_all(&self, ctx: &Context, requests: Vec<CommentRequest>) -> usize {
        if requests.is_empty() {
            return 0;
        }
        let mut set = JoinSet::new();
        for request in requests {
            let host = self.host.clone();
            set.spawn(async move {
                let res = host.post_comment(&request.repo, request.number, &request.text).await;
                (request, res)
            });
        }

        let mut posted = 0;
        loop {
            match ctx.run(set.join_next()).await {
                Ok(None) => break,
                Ok(Some(Ok((_, Ok(()))))) => posted += 1,
                Ok(Some(Ok((request, Err(e))))) => {
                    tracing::warn!("cannot comment on {}#{}: {}", request.repo, request.number, e)
                }
                Ok(Some(Err(e))) => tracing::warn!("comment task failed: {}", e),
                Err(e) => {
                    tracing::warn!("abandoning {} pending comment(s): {}", set.len(), e);
                    set.abort_all();
                    break;
                }
            }
        }
        posted
    }
}

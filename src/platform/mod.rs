//! The link aggregator the articles are published to.
//!
//! [`Platform`] is the seam between the scheduler and the remote service.
//! [`reddit::RedditClient`] implements it over the Reddit OAuth API; tests use
//! an in-memory fake.

pub mod reddit;

use crate::error::PlatformError;
use crate::models::{FlairTemplate, Submission, WikiPage};

pub use reddit::RedditClient;

/// Operations consumed from the remote platform.
pub trait Platform {
    /// Link posts in `community` returned by a search for `url`, newest first.
    ///
    /// Matching is the platform's own and is looser than string equality:
    /// hits may point at other URLs sharing a prefix with `url`.
    async fn search_by_url(
        &self,
        community: &str,
        url: &str,
    ) -> Result<Vec<Submission>, PlatformError>;

    /// Submit a link post without self-text or flair.
    ///
    /// Resubmission is refused by the platform with a structured
    /// `ALREADY_SUB` error; see [`PlatformError::is_already_submitted`].
    async fn submit_link(
        &self,
        community: &str,
        title: &str,
        url: &str,
    ) -> Result<Submission, PlatformError>;

    async fn add_to_collection(
        &self,
        collection_id: &str,
        submission: &Submission,
    ) -> Result<(), PlatformError>;

    async fn link_flair_templates(&self, community: &str)
    -> Result<Vec<FlairTemplate>, PlatformError>;

    /// Content of a moderator wiki page and the authors of all its revisions.
    async fn wiki_page(&self, community: &str, page: &str) -> Result<WikiPage, PlatformError>;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ApiErrorItem;
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;

    /// In-memory platform recording every call.
    #[derive(Default)]
    pub(crate) struct FakePlatform {
        /// community → posts, oldest first
        pub(crate) posts: RefCell<BTreeMap<String, Vec<Submission>>>,
        /// URLs whose submission fails with `ALREADY_SUB` without being searchable
        pub(crate) hidden_duplicates: RefCell<Vec<String>>,
        /// Structured error returned by every submission, if set
        pub(crate) submit_error: RefCell<Option<Vec<ApiErrorItem>>>,
        pub(crate) fail_collection: Cell<bool>,
        pub(crate) collection: RefCell<Vec<String>>,
        pub(crate) submissions: RefCell<Vec<(String, String)>>,
        pub(crate) searches: Cell<usize>,
        pub(crate) flairs: RefCell<Vec<FlairTemplate>>,
        pub(crate) wiki: RefCell<WikiPage>,
        next_id: Cell<u32>,
    }

    pub(crate) fn already_sub() -> ApiErrorItem {
        ApiErrorItem {
            code: "ALREADY_SUB".to_string(),
            message: "that link has already been submitted".to_string(),
            field: Some("url".to_string()),
        }
    }

    impl FakePlatform {
        /// Seed an existing post.
        pub(crate) fn post(&self, community: &str, url: &str, created_utc: f64) -> Submission {
            let id = self.next_id.get() + 1;
            self.next_id.set(id);
            let submission = Submission {
                id: format!("p{id}"),
                permalink: format!("/r/{community}/comments/p{id}/"),
                created_utc,
                url: Some(url.to_string()),
            };
            self.posts
                .borrow_mut()
                .entry(community.to_string())
                .or_default()
                .push(submission.clone());
            submission
        }
    }

    impl Platform for FakePlatform {
        async fn search_by_url(
            &self,
            community: &str,
            url: &str,
        ) -> Result<Vec<Submission>, PlatformError> {
            self.searches.set(self.searches.get() + 1);
            let posts = self.posts.borrow();
            Ok(posts
                .get(community)
                .map(|posts| {
                    posts
                        .iter()
                        .rev()
                        .filter(|s| s.url.as_deref().is_some_and(|u| u.starts_with(url)))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn submit_link(
            &self,
            community: &str,
            _title: &str,
            url: &str,
        ) -> Result<Submission, PlatformError> {
            if let Some(items) = self.submit_error.borrow().clone() {
                return Err(PlatformError::Api(items));
            }
            if self.hidden_duplicates.borrow().iter().any(|u| u == url) {
                return Err(PlatformError::Api(vec![already_sub()]));
            }
            self.submissions
                .borrow_mut()
                .push((community.to_string(), url.to_string()));
            Ok(self.post(community, url, 1_704_153_600.0))
        }

        async fn add_to_collection(
            &self,
            _collection_id: &str,
            submission: &Submission,
        ) -> Result<(), PlatformError> {
            if self.fail_collection.get() {
                return Err(PlatformError::Api(vec![ApiErrorItem {
                    code: "INVALID_OPTION".to_string(),
                    message: "collection is full".to_string(),
                    field: None,
                }]));
            }
            self.collection.borrow_mut().push(submission.fullname());
            Ok(())
        }

        async fn link_flair_templates(
            &self,
            _community: &str,
        ) -> Result<Vec<FlairTemplate>, PlatformError> {
            Ok(self.flairs.borrow().clone())
        }

        async fn wiki_page(
            &self,
            _community: &str,
            _page: &str,
        ) -> Result<WikiPage, PlatformError> {
            Ok(self.wiki.borrow().clone())
        }
    }
}

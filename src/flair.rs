//! Startup check that categories, link flairs and automoderator rules agree.
//!
//! Every category has a mod-only text flair whose text is the uppercased
//! category name. The community's `config/automoderator` wiki page assigns
//! that flair to posts by URL prefix, one rule per category:
//!
//! ```yaml
//! ---
//! url: ["telex.hu/belfold/"]
//! action: approve
//! set_flair:
//!   template_id: 3f6a0c1e-…
//! ```
//!
//! The page must consist of these rules only and must have been edited by
//! the script's author alone.

use std::collections::BTreeMap;

use itertools::Itertools;
use regex::Regex;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::RedditConfig;
use crate::error::FlairError;
use crate::platform::Platform;
use crate::registry::CategoryRegistry;

pub const AUTOMODERATOR_PAGE: &str = "config/automoderator";

/// Counts of what was verified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlairReport {
    pub flairs: usize,
    pub rules: usize,
}

fn site_host(site_url: &str) -> String {
    Url::parse(site_url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.trim_start_matches("www.").to_string()))
        .unwrap_or_else(|| site_url.to_string())
}

fn rule_pattern(host: &str) -> Result<Regex, FlairError> {
    let pattern = format!(
        concat!(
            r#"---\s+url: \["{}/([\w-]+)/"\]\s+action:\s*approve\s+"#,
            r#"set_flair:\s+template_id:\s*([\da-f-]+)\s*"#,
        ),
        regex::escape(host)
    );
    Regex::new(&pattern).map_err(|e| FlairError::Automoderator(e.to_string()))
}

/// Parse the automoderator page into category → flair template id.
///
/// Rules must follow each other without anything in between.
pub fn parse_rules(content: &str, host: &str) -> Result<BTreeMap<String, String>, FlairError> {
    let content = content.trim();
    let pattern = rule_pattern(host)?;
    let mut rules: BTreeMap<String, String> = BTreeMap::new();
    let mut last = 0usize;

    for captures in pattern.captures_iter(content) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        if whole.start() != last {
            return Err(FlairError::Automoderator(format!(
                "unexpected content at offset {last}"
            )));
        }
        last = whole.end();
        let class = captures[1].to_string();
        let template_id = captures[2].to_string();
        if rules.contains_key(&class) {
            return Err(FlairError::Automoderator(format!("duplicate flair: {class}")));
        }
        if let Some((other, _)) = rules.iter().find(|(_, id)| **id == template_id) {
            return Err(FlairError::Automoderator(format!(
                "flair ({other}) template_id redundant: {template_id}"
            )));
        }
        rules.insert(class, template_id);
    }
    if last != content.len() {
        return Err(FlairError::Automoderator(format!(
            "unexpected content at offset {last}"
        )));
    }
    Ok(rules)
}

/// Verify the registry against the primary community's flairs and rules.
#[instrument(level = "info", skip_all, fields(community = %reddit.subreddit))]
pub async fn check_categories<P: Platform>(
    platform: &P,
    registry: &CategoryRegistry,
    reddit: &RedditConfig,
    site_url: &str,
) -> Result<FlairReport, FlairError> {
    debug!(categories = registry.len(), "Checking categories");
    let mut flairs: BTreeMap<String, String> = BTreeMap::new();
    for flair in platform.link_flair_templates(&reddit.subreddit).await? {
        if flair.kind != "text" || !flair.mod_only {
            continue;
        }
        if flairs.contains_key(&flair.css_class) {
            return Err(FlairError::Duplicate(flair.css_class));
        }
        let Some(name) = registry.get(&flair.css_class) else {
            return Err(FlairError::MissingFromRegistry(flair.css_class));
        };
        if flair.text != name.to_uppercase() {
            return Err(FlairError::TextMismatch {
                class: flair.css_class,
                text: flair.text,
                expected: name.to_uppercase(),
            });
        }
        flairs.insert(flair.css_class, flair.id);
    }
    if let Some((slug, _)) = registry.iter().find(|(slug, _)| !flairs.contains_key(*slug)) {
        return Err(FlairError::MissingFlair(slug.to_string()));
    }

    let page = platform
        .wiki_page(&reddit.subreddit, AUTOMODERATOR_PAGE)
        .await?;
    if let Some(author) = page
        .revision_authors
        .iter()
        .find(|author| **author != reddit.script_author)
    {
        return Err(FlairError::Author(author.clone()));
    }

    let rules = parse_rules(&page.content_md, &site_host(site_url))?;
    for (class, template_id) in &rules {
        match flairs.get(class) {
            None => {
                return Err(FlairError::Automoderator(format!(
                    "flair missing from categories: {class}"
                )));
            }
            Some(id) if id != template_id => {
                return Err(FlairError::Automoderator(format!(
                    "flair ({class}) template_id mismatch: {template_id}"
                )));
            }
            Some(_) => {}
        }
    }

    let unassigned = flairs.keys().filter(|class| !rules.contains_key(*class)).join(", ");
    if !unassigned.is_empty() {
        warn!(flairs = %unassigned, "Flairs without automoderator rule");
    }

    let report = FlairReport {
        flairs: flairs.len(),
        rules: rules.len(),
    };
    info!(flairs = report.flairs, rules = report.rules, "Categories consistent");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample;
    use crate::models::{FlairTemplate, WikiPage};
    use crate::platform::tests::FakePlatform;
    use tempfile::tempdir;

    const BELFOLD_ID: &str = "3f6a0c1e-0000-4000-8000-000000000001";
    const KULFOLD_ID: &str = "3f6a0c1e-0000-4000-8000-000000000002";

    fn flair(id: &str, class: &str, text: &str) -> FlairTemplate {
        FlairTemplate {
            id: id.to_string(),
            text: text.to_string(),
            css_class: class.to_string(),
            kind: "text".to_string(),
            mod_only: true,
        }
    }

    fn rule(class: &str, id: &str) -> String {
        format!(
            "---\nurl: [\"telex.hu/{class}/\"]\naction: approve\nset_flair:\n  template_id: {id}\n"
        )
    }

    async fn registry() -> (tempfile::TempDir, CategoryRegistry) {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("categories.yaml");
        std::fs::write(&path, "belfold: Belföld\nkulfold: Külföld\n").unwrap();
        let registry = CategoryRegistry::load(&path).await.expect("registry");
        (dir, registry)
    }

    fn consistent_platform() -> FakePlatform {
        let platform = FakePlatform::default();
        *platform.flairs.borrow_mut() = vec![
            flair(BELFOLD_ID, "belfold", "BELFÖLD"),
            flair(KULFOLD_ID, "kulfold", "KÜLFÖLD"),
            FlairTemplate {
                mod_only: false,
                ..flair("user", "user", "Anything")
            },
        ];
        *platform.wiki.borrow_mut() = WikiPage {
            content_md: format!(
                "\n{}\n{}\n",
                rule("belfold", BELFOLD_ID),
                rule("kulfold", KULFOLD_ID)
            ),
            revision_authors: vec!["owner".to_string(), "owner".to_string()],
        };
        platform
    }

    #[tokio::test]
    async fn consistent_setup_passes() {
        let (_dir, registry) = registry().await;
        let platform = consistent_platform();
        let report = check_categories(&platform, &registry, &sample().reddit, "https://telex.hu")
            .await
            .unwrap();
        assert_eq!(report, FlairReport { flairs: 2, rules: 2 });
    }

    #[tokio::test]
    async fn flair_problems_are_reported() {
        let (_dir, registry) = registry().await;
        let reddit = sample().reddit;

        let platform = consistent_platform();
        platform.flairs.borrow_mut()[1].text = "VILÁG".to_string();
        let err = check_categories(&platform, &registry, &reddit, "https://telex.hu")
            .await
            .unwrap_err();
        assert!(matches!(err, FlairError::TextMismatch { .. }));

        let platform = consistent_platform();
        platform.flairs.borrow_mut().remove(1);
        let err = check_categories(&platform, &registry, &reddit, "https://telex.hu")
            .await
            .unwrap_err();
        assert!(matches!(err, FlairError::MissingFlair(ref c) if c == "kulfold"));

        let platform = consistent_platform();
        platform
            .flairs
            .borrow_mut()
            .push(flair("x", "belfold", "BELFÖLD"));
        let err = check_categories(&platform, &registry, &reddit, "https://telex.hu")
            .await
            .unwrap_err();
        assert!(matches!(err, FlairError::Duplicate(_)));

        let platform = consistent_platform();
        platform
            .flairs
            .borrow_mut()
            .push(flair("y", "sport", "SPORT"));
        let err = check_categories(&platform, &registry, &reddit, "https://telex.hu")
            .await
            .unwrap_err();
        assert!(matches!(err, FlairError::MissingFromRegistry(_)));
    }

    #[tokio::test]
    async fn foreign_automoderator_author_is_rejected() {
        let (_dir, registry) = registry().await;
        let platform = consistent_platform();
        platform
            .wiki
            .borrow_mut()
            .revision_authors
            .push("intruder".to_string());
        let err = check_categories(&platform, &registry, &sample().reddit, "https://telex.hu")
            .await
            .unwrap_err();
        assert!(matches!(err, FlairError::Author(ref a) if a == "intruder"));
    }

    #[tokio::test]
    async fn template_id_must_match_flair() {
        let (_dir, registry) = registry().await;
        let platform = consistent_platform();
        platform.wiki.borrow_mut().content_md =
            format!("{}{}", rule("belfold", KULFOLD_ID), rule("kulfold", BELFOLD_ID));
        let err = check_categories(&platform, &registry, &sample().reddit, "https://telex.hu")
            .await
            .unwrap_err();
        assert!(matches!(err, FlairError::Automoderator(ref m) if m.contains("mismatch")));
    }

    #[test]
    fn rules_must_be_contiguous_and_unique() {
        let host = "telex.hu";
        let good = format!("{}{}", rule("belfold", BELFOLD_ID), rule("kulfold", KULFOLD_ID));
        assert_eq!(parse_rules(&good, host).unwrap().len(), 2);

        let gap = format!("{}# note\n{}", rule("belfold", BELFOLD_ID), rule("kulfold", KULFOLD_ID));
        assert!(parse_rules(&gap, host).is_err());

        let trailing = format!("{}extra: true", rule("belfold", BELFOLD_ID));
        assert!(parse_rules(&trailing, host).is_err());

        let duplicate = format!("{}{}", rule("belfold", BELFOLD_ID), rule("belfold", KULFOLD_ID));
        assert!(parse_rules(&duplicate, host).is_err());

        let redundant = format!("{}{}", rule("belfold", BELFOLD_ID), rule("kulfold", BELFOLD_ID));
        let err = parse_rules(&redundant, host).unwrap_err();
        assert!(err.to_string().contains("redundant"));

        assert!(parse_rules(&rule("belfold", BELFOLD_ID), "index.hu").is_err());
        assert!(parse_rules("", host).unwrap().is_empty());
    }

    #[test]
    fn host_ignores_www_prefix() {
        assert_eq!(site_host("https://www.telex.hu/"), "telex.hu");
        assert_eq!(site_host("https://telex.hu"), "telex.hu");
    }
}

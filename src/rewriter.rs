use regex::{Captures, NoExpand, Regex};

use crate::errors::{AppError, AppResult};
use crate::models::MediaId;

/// Substitutes a media placeholder in post content with the final URL.
///
/// Implementations must be idempotent: replacing an id whose placeholder is
/// already resolved returns the content unchanged, because a batch can be
/// applied again after a conflict. A conflict is reported as
/// `AppError::RewriteConflict`.
pub trait PostContentRewriter: Send + Sync {
    fn replace(&self, content: &str, media_id: MediaId, media_url: &str) -> AppResult<String>;
}

/// Rewrites `<img>` placeholders of the form
/// `<img src="file:///local.jpg" data-local-media-id="42">`.
///
/// The marker attribute is dropped once the `src` points at the remote URL,
/// so a resolved tag no longer matches.
pub struct PlaceholderRewriter {
    tag: Regex,
    marker: Regex,
    src: Regex,
}

impl PlaceholderRewriter {
    pub fn new() -> AppResult<Self> {
        let tag = Regex::new(r#"<img\b[^>]*\bdata-local-media-id="(\d+)"[^>]*>"#)
            .map_err(|e| AppError::Internal(format!("placeholder pattern: {}", e)))?;
        let marker = Regex::new(r#"\s*\bdata-local-media-id="\d+""#)
            .map_err(|e| AppError::Internal(format!("marker pattern: {}", e)))?;
        let src = Regex::new(r#"\ssrc="[^"]*""#)
            .map_err(|e| AppError::Internal(format!("src pattern: {}", e)))?;

        Ok(Self { tag, marker, src })
    }

    /// Ids of placeholders still waiting for a remote URL.
    pub fn unresolved_media_ids(&self, content: &str) -> Vec<MediaId> {
        self.tag
            .captures_iter(content)
            .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
            .collect()
    }

    fn resolve_tag(&self, tag: &str, media_url: &str) -> String {
        let without_marker = self.marker.replace(tag, "");
        let src_attr = format!(r#"src="{}""#, media_url.replace('"', "&quot;"));

        if self.src.is_match(&without_marker) {
            self.src
                .replace(&without_marker, NoExpand(&format!(" {}", src_attr)))
                .into_owned()
        } else {
            // "<img" is always the first four bytes of a matched tag
            format!("<img {}{}", src_attr, &without_marker[4..])
        }
    }
}

impl PostContentRewriter for PlaceholderRewriter {
    fn replace(&self, content: &str, media_id: MediaId, media_url: &str) -> AppResult<String> {
        let rewritten = self.tag.replace_all(content, |caps: &Captures| {
            let matches_id = caps
                .get(1)
                .and_then(|id| id.as_str().parse::<MediaId>().ok())
                == Some(media_id);

            if matches_id {
                self.resolve_tag(&caps[0], media_url)
            } else {
                caps[0].to_string()
            }
        });

        Ok(rewritten.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL_A: &str = "https://cdn.example.com/a.jpg";

    #[test]
    fn test_replaces_only_matching_placeholder() {
        let rewriter = PlaceholderRewriter::new().unwrap();
        let content = r#"<p>x</p><img src="file:///a.jpg" data-local-media-id="1" class="wide"><img src="file:///b.jpg" data-local-media-id="2">"#;

        let out = rewriter.replace(content, 1, URL_A).unwrap();

        assert_eq!(
            out,
            r#"<p>x</p><img src="https://cdn.example.com/a.jpg" class="wide"><img src="file:///b.jpg" data-local-media-id="2">"#
        );
        assert_eq!(rewriter.unresolved_media_ids(&out), vec![2]);
    }

    #[test]
    fn test_replace_is_idempotent() {
        let rewriter = PlaceholderRewriter::new().unwrap();
        let content = r#"<img data-local-media-id="7" src="file:///a.jpg" />"#;

        let once = rewriter.replace(content, 7, URL_A).unwrap();
        let twice = rewriter.replace(&once, 7, URL_A).unwrap();

        assert_eq!(once, twice);
        assert!(rewriter.unresolved_media_ids(&twice).is_empty());
    }

    #[test]
    fn test_placeholder_without_src_gets_one() {
        let rewriter = PlaceholderRewriter::new().unwrap();
        let out = rewriter
            .replace(r#"<img data-local-media-id="3" alt="cat">"#, 3, URL_A)
            .unwrap();
        assert_eq!(out, r#"<img src="https://cdn.example.com/a.jpg" alt="cat">"#);
    }

    #[test]
    fn test_dollar_signs_in_url_are_literal() {
        let rewriter = PlaceholderRewriter::new().unwrap();
        let out = rewriter
            .replace(r#"<img src="x" data-local-media-id="4">"#, 4, "https://h/$1.png")
            .unwrap();
        assert_eq!(out, r#"<img src="https://h/$1.png">"#);
    }

    #[test]
    fn test_similar_ids_do_not_collide() {
        let rewriter = PlaceholderRewriter::new().unwrap();
        let content = r#"<img src="x" data-local-media-id="12">"#;
        let out = rewriter.replace(content, 1, URL_A).unwrap();
        assert_eq!(out, content);
    }
}

use color_eyre::{eyre::eyre, Result};
use regex::Regex;
use reqwest::Method;
use url::{Position, Url};

use crate::fetch::Request;

/// Decides which requests go through stale-while-revalidate.
///
/// A request is routed when it is a GET to the worker's own origin and its
/// path (with query) matches one of the patterns.
#[derive(Debug, Clone)]
pub struct Router {
  origin: Url,
  patterns: Vec<Regex>,
}

impl Router {
  pub fn new(origin: Url, patterns: &[String]) -> Result<Self> {
    let patterns = patterns
      .iter()
      .map(|p| Regex::new(p).map_err(|e| eyre!("Invalid route pattern '{}': {}", p, e)))
      .collect::<Result<Vec<_>>>()?;

    Ok(Self { origin, patterns })
  }

  pub fn matches(&self, request: &Request) -> bool {
    if request.method != Method::GET || request.url.origin() != self.origin.origin() {
      return false;
    }

    let path = &request.url[Position::BeforePath..Position::AfterQuery];
    self.patterns.iter().any(|p| p.is_match(path))
  }
}

//! The review queue: durable borderline decisions awaiting adjudication.
//!
//! A pair lands here when the matcher scores it inside a stage's review band
//! or when it tied with another pair. Items stay pending indefinitely; the
//! engine treats pending pairs as provisionally unmatched and re-applies
//! verdicts on every later run.

use std::{collections::VecDeque, fmt, future::Future};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
  matcher::{MatchDecision, PairKey, Stage},
  model::{CandidateIdentity, SourceRef},
};

/// Namespace for review decision ids.
const REVIEW_NAMESPACE: Uuid = Uuid::from_u128(0x6c1f_4a52_93d0_4e8b_a7f1_02b5_c9e3_7d41);

/// Deterministic id of the decision about `(left, right)`, so re-enqueueing
/// the same pair on a later run hits the same row.
pub fn decision_id_for(left: &SourceRef, right: &SourceRef) -> Uuid {
  Uuid::new_v5(&REVIEW_NAMESPACE, format!("{left}|{right}").as_bytes())
}

// ─── Verdict ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
  Accept,
  Reject,
}

impl Verdict {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Accept => "accept",
      Self::Reject => "reject",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "accept" => Some(Self::Accept),
      "reject" => Some(Self::Reject),
      _ => None,
    }
  }
}

impl fmt::Display for Verdict {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

// ─── Items ───────────────────────────────────────────────────────────────────

/// Input to [`ReviewQueue::enqueue`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewReview {
  pub left:  CandidateIdentity,
  pub right: CandidateIdentity,
  pub score: f64,
  pub stage: Stage,
  pub tied:  bool,
}

impl NewReview {
  pub fn decision_id(&self) -> Uuid {
    decision_id_for(&self.left.source_ref(), &self.right.source_ref())
  }
}

impl From<&MatchDecision> for NewReview {
  fn from(d: &MatchDecision) -> Self {
    Self {
      left:  d.left.clone(),
      right: d.right.clone(),
      score: d.score,
      stage: d.stage,
      tied:  d.tied,
    }
  }
}

/// A persisted review decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewItem {
  pub decision_id: Uuid,
  pub left:        CandidateIdentity,
  pub right:       CandidateIdentity,
  pub score:       f64,
  pub stage:       Stage,
  pub tied:        bool,
  /// `None` while pending.
  pub verdict:     Option<Verdict>,
  pub created_at:  DateTime<Utc>,
  pub resolved_at: Option<DateTime<Utc>>,
}

impl ReviewItem {
  pub fn is_pending(&self) -> bool { self.verdict.is_none() }

  pub fn pair_key(&self) -> PairKey { (self.left.source_ref(), self.right.source_ref()) }
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Durable storage for review decisions.
pub trait ReviewQueue: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Persist a pending decision. Idempotent: if the pair already has a
  /// decision (pending or resolved) it is returned unchanged.
  fn enqueue(
    &self,
    review: NewReview,
  ) -> impl Future<Output = Result<ReviewItem, Self::Error>> + Send + '_;

  /// Up to `limit` pending items with `decision_id > after`, ordered by
  /// `decision_id`.
  fn list_pending_page(
    &self,
    after: Option<Uuid>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<ReviewItem>, Self::Error>> + Send + '_;

  fn get_review(
    &self,
    decision_id: Uuid,
  ) -> impl Future<Output = Result<Option<ReviewItem>, Self::Error>> + Send + '_;

  /// Record a verdict. Resolving again with the same verdict is a no-op;
  /// a different verdict fails with [`crate::Error::AlreadyResolved`], an
  /// unknown id with [`crate::Error::DecisionNotFound`].
  fn resolve(
    &self,
    decision_id: Uuid,
    verdict: Verdict,
  ) -> impl Future<Output = Result<ReviewItem, Self::Error>> + Send + '_;

  /// Every resolved decision, ordered by `decision_id`.
  fn resolved_reviews(
    &self,
  ) -> impl Future<Output = Result<Vec<ReviewItem>, Self::Error>> + Send + '_;

  /// Lazy pager over all pending items.
  fn list_pending(&self, page_size: usize) -> PendingReviews<'_, Self>
  where
    Self: Sized,
  {
    PendingReviews::new(self, page_size)
  }
}

// ─── Pending cursor ──────────────────────────────────────────────────────────

/// A finite, restartable sequence of pending review items fetched one page
/// at a time. Items resolved between pages are skipped; the cursor position
/// is the last `decision_id` yielded.
pub struct PendingReviews<'q, Q: ReviewQueue> {
  queue:     &'q Q,
  page_size: usize,
  after:     Option<Uuid>,
  buffer:    VecDeque<ReviewItem>,
  exhausted: bool,
}

impl<'q, Q: ReviewQueue> PendingReviews<'q, Q> {
  pub fn new(queue: &'q Q, page_size: usize) -> Self {
    Self {
      queue,
      page_size: page_size.max(1),
      after: None,
      buffer: VecDeque::new(),
      exhausted: false,
    }
  }

  /// Resume after a previously seen decision.
  pub fn starting_after(mut self, decision_id: Uuid) -> Self {
    self.after = Some(decision_id);
    self
  }

  /// The last decision id yielded, for resuming later.
  pub fn position(&self) -> Option<Uuid> { self.after }

  /// Rewind to the beginning of the queue.
  pub fn restart(&mut self) {
    self.after = None;
    self.buffer.clear();
    self.exhausted = false;
  }

  pub async fn next(&mut self) -> Result<Option<ReviewItem>, Q::Error> {
    if self.buffer.is_empty() && !self.exhausted {
      let page = self.queue.list_pending_page(self.after, self.page_size).await?;
      if page.len() < self.page_size {
        self.exhausted = true;
      }
      self.buffer.extend(page);
    }

    let item = self.buffer.pop_front();
    if let Some(item) = &item {
      self.after = Some(item.decision_id);
    }
    Ok(item)
  }

  /// Drain the remaining items.
  pub async fn collect_all(&mut self) -> Result<Vec<ReviewItem>, Q::Error> {
    let mut items = Vec::new();
    while let Some(item) = self.next().await? {
      items.push(item);
    }
    Ok(items)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn decision_id_is_stable_and_directional() {
    let l = SourceRef::new("liveheats", "17");
    let r = SourceRef::new("pwa", "4410");
    assert_eq!(decision_id_for(&l, &r), decision_id_for(&l, &r));
    assert_ne!(decision_id_for(&l, &r), decision_id_for(&r, &l));
    assert_eq!(decision_id_for(&l, &r).get_version_num(), 5);
  }

  #[test]
  fn verdict_parses_its_own_names() {
    assert_eq!(Verdict::parse("accept"), Some(Verdict::Accept));
    assert_eq!(Verdict::parse(Verdict::Reject.as_str()), Some(Verdict::Reject));
    assert_eq!(Verdict::parse("maybe"), None);
    assert_eq!(Verdict::Accept.to_string(), "accept");
  }
}

use crate::common::data::{
    CompletionChecker, RecordedRequest, RequestMatcher, ResponseHandler, RuleData,
};
use crate::server::matchers;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("validation error: {0}")]
    ValidationError(String),
}

/// A registered rule plus its runtime state: the requests it has served, in
/// arrival order, and whether its completion checker has shut it off.
#[derive(Debug)]
pub struct ActiveRule {
    pub id: usize,
    pub matchers: Vec<RequestMatcher>,
    pub handler: ResponseHandler,
    pub checker: CompletionChecker,
    seen: Vec<Arc<RecordedRequest>>,
    completed: bool,
}

impl ActiveRule {
    pub fn seen(&self) -> &[Arc<RecordedRequest>] {
        &self.seen
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

/// The registry owns all rule records. Handles refer to rules by id only
/// and read through this interface.
pub trait StateManager {
    /// Appends a rule at the tail of the active list and returns its id.
    fn add_rule(&self, rule: RuleData) -> Result<usize, Error>;

    /// An atomic, point-in-time view of the active list. In-flight requests
    /// keep matching against the snapshot they captured.
    fn snapshot(&self) -> Vec<Arc<Mutex<ActiveRule>>>;

    /// Removes all rules. Seen lists of removed rules become unreachable.
    fn reset(&self);

    /// Ids of the active rules, in registration order.
    fn rule_ids(&self) -> Vec<usize>;

    /// The recorded requests of the rule with the given id, or empty when
    /// the rule has been removed.
    fn seen_requests(&self, id: usize) -> Vec<Arc<RecordedRequest>>;
}

#[derive(Default)]
struct RegistryState {
    next_rule_id: usize,
    rules: Vec<Arc<Mutex<ActiveRule>>>,
}

/// In-memory [`StateManager`]. Rule ids stay unique for the lifetime of the
/// registry, across resets.
#[derive(Default)]
pub struct RuleRegistry {
    state: Mutex<RegistryState>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateManager for RuleRegistry {
    fn add_rule(&self, rule: RuleData) -> Result<usize, Error> {
        validate_rule(&rule)?;

        let mut state = self.state.lock().expect("rule registry lock poisoned");

        let id = state.next_rule_id;
        state.next_rule_id += 1;

        tracing::debug!("adding rule with id={}", id);

        state.rules.push(Arc::new(Mutex::new(ActiveRule {
            id,
            matchers: rule.matchers,
            handler: rule.handler,
            checker: rule.completion_checker.unwrap_or(CompletionChecker::Always),
            seen: Vec::new(),
            completed: false,
        })));

        Ok(id)
    }

    fn snapshot(&self) -> Vec<Arc<Mutex<ActiveRule>>> {
        self.state
            .lock()
            .expect("rule registry lock poisoned")
            .rules
            .clone()
    }

    fn reset(&self) {
        let mut state = self.state.lock().expect("rule registry lock poisoned");
        state.rules.clear();

        tracing::debug!("removed all rules");
    }

    fn rule_ids(&self) -> Vec<usize> {
        self.state
            .lock()
            .expect("rule registry lock poisoned")
            .rules
            .iter()
            .map(|rule| rule.lock().expect("rule lock poisoned").id)
            .collect()
    }

    fn seen_requests(&self, id: usize) -> Vec<Arc<RecordedRequest>> {
        let rules = self.snapshot();

        rules
            .iter()
            .map(|rule| rule.lock().expect("rule lock poisoned"))
            .find(|rule| rule.id == id)
            .map(|rule| rule.seen().to_vec())
            .unwrap_or_default()
    }
}

fn validate_rule(rule: &RuleData) -> Result<(), Error> {
    for matcher in &rule.matchers {
        if let RequestMatcher::Protocol { protocol } = matcher {
            if protocol != "http" && protocol != "https" {
                return Err(Error::ValidationError(format!(
                    "unknown protocol {:?}, expected \"http\" or \"https\"",
                    protocol
                )));
            }
        }
    }

    if let Some(CompletionChecker::Times { count }) = &rule.completion_checker {
        if *count == 0 {
            return Err(Error::ValidationError(
                "a times checker needs a count of at least 1".to_string(),
            ));
        }
    }

    Ok(())
}

/// Whether a rule's checker still accepts requests, judged on its seen list.
pub(crate) fn checker_accepts(checker: &CompletionChecker, seen: &[Arc<RecordedRequest>]) -> bool {
    match checker {
        CompletionChecker::Always => true,
        CompletionChecker::Once => seen.is_empty(),
        CompletionChecker::Twice => seen.len() < 2,
        CompletionChecker::Thrice => seen.len() < 3,
        CompletionChecker::Times { count } => seen.len() < *count,
        CompletionChecker::Custom {
            predicate: Some(predicate),
            ..
        } => predicate.accepts(seen),
        CompletionChecker::Custom {
            predicate: None,
            callback_id,
        } => {
            tracing::warn!(
                "custom completion checker {:?} has no resolvable predicate, keeping rule active",
                callback_id
            );
            true
        }
    }
}

/// The handler selected for a request, with its originating rule.
pub(crate) struct SelectedHandler {
    pub rule_id: usize,
    pub handler: ResponseHandler,
}

/// Walks the snapshot in registration order and picks the first rule whose
/// matchers all accept and whose checker has not shut it off. The request
/// is appended to the winning rule's seen list before the handler runs, so
/// observers see it in the list no later than the response event.
///
/// Matcher evaluation happens outside the rule lock (custom matchers may
/// suspend); the checker consult and the seen append are a single locked
/// step.
pub(crate) async fn select_rule(
    snapshot: &[Arc<Mutex<ActiveRule>>],
    req: &Arc<RecordedRequest>,
) -> Option<SelectedHandler> {
    for rule in snapshot {
        let (rule_id, rule_matchers, completed) = {
            let rule = rule.lock().expect("rule lock poisoned");
            (rule.id, rule.matchers.clone(), rule.completed)
        };

        if completed {
            continue;
        }

        if !matchers::request_matches(req, &rule_matchers).await {
            continue;
        }

        let mut rule = rule.lock().expect("rule lock poisoned");

        // Re-check under the lock: a concurrent request may have consumed
        // the rule's remaining capacity between evaluation and selection.
        if rule.completed || !checker_accepts(&rule.checker, &rule.seen) {
            tracing::debug!("rule {} matched but is complete, falling through", rule_id);
            continue;
        }

        rule.seen.push(req.clone());
        if !checker_accepts(&rule.checker, &rule.seen) {
            rule.completed = true;
        }

        tracing::debug!("request {} matched rule {}", req.id(), rule_id);

        return Some(SelectedHandler {
            rule_id,
            handler: rule.handler.clone(),
        });
    }

    tracing::debug!("request {} matched no rule", req.id());

    None
}

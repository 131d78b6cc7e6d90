//! Reception routing: *answer* or *script*.
//!
//! The reception agent is the first stop for every user turn.  Its reply is
//! interpreted by shape:
//!
//! | Reply shape | Route | Payload |
//! |---|---|---|
//! | starts with `script`, contains `<task>…</task>` | script | inner task text |
//! | starts with `script`, no `<task>` block | script | original user task |
//! | exactly `script` | script | original user task |
//! | whitespace only | script | original user task |
//! | anything else | answer | full trimmed reply |
//!
//! The streaming variant buffers tokens until the `script` prefix is
//! decidable so the user never sees any fragment of the routing keyword; an
//! answer flushes the buffer and passes the rest through, while a script
//! reply is consumed silently.

const ROUTE_KEYWORD: &str = "script";

/// Routing decision for one user turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Free text sent straight back to the user.
    Answer(String),
    /// The task forwarded to the repair loop; `rewritten` marks a router
    /// rewrite inside a `<task>` block.
    Script { task: String, rewritten: bool },
}

/// Interpret a complete reception reply.
pub fn interpret_reply(reply: &str, original_task: &str) -> Route {
    let trimmed = reply.trim();
    if trimmed.is_empty() {
        return Route::Script {
            task: original_task.to_string(),
            rewritten: false,
        };
    }

    if starts_with_keyword(trimmed) {
        if let Some(task) = extract_task_block(trimmed) {
            return Route::Script {
                task,
                rewritten: true,
            };
        }
        return Route::Script {
            task: original_task.to_string(),
            rewritten: false,
        };
    }

    Route::Answer(trimmed.to_string())
}

fn starts_with_keyword(trimmed: &str) -> bool {
    // Byte-wise comparison sidesteps UTF-8 boundary issues on non-ASCII
    // replies; the keyword itself is plain ASCII.
    trimmed.len() >= ROUTE_KEYWORD.len()
        && trimmed.as_bytes()[..ROUTE_KEYWORD.len()].eq_ignore_ascii_case(ROUTE_KEYWORD.as_bytes())
}

/// The trimmed text inside the first `<task>…</task>` block, if any.
fn extract_task_block(reply: &str) -> Option<String> {
    let start = reply.find("<task>")? + "<task>".len();
    let end = reply[start..].find("</task>")? + start;
    Some(reply[start..end].trim().to_string())
}

/// Incremental routing decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Not enough characters buffered yet; emit nothing.
    Pending,
    /// The reply is an answer; flushed tokens stream to the user.
    Answer,
    /// The reply is a script directive; everything is consumed silently.
    Script,
}

/// State machine deciding the route while the reception reply streams in.
///
/// Invariant: before the decision is made, nothing is emitted; in
/// particular no prefix of the word `script` ever reaches the user.
pub struct StreamingRouteDecider {
    decision: RouteDecision,
    /// Tokens held back until the decision is known.
    buffer: String,
    /// Complete reply, for final interpretation.
    full_reply: String,
}

impl StreamingRouteDecider {
    pub fn new() -> Self {
        StreamingRouteDecider {
            decision: RouteDecision::Pending,
            buffer: String::new(),
            full_reply: String::new(),
        }
    }

    pub fn decision(&self) -> RouteDecision {
        self.decision
    }

    /// Feed one token; returns the text that may be shown to the user now.
    pub fn push(&mut self, token: &str) -> Option<String> {
        self.full_reply.push_str(token);
        match self.decision {
            RouteDecision::Answer => Some(token.to_string()),
            RouteDecision::Script => None,
            RouteDecision::Pending => {
                self.buffer.push_str(token);
                self.decide();
                match self.decision {
                    RouteDecision::Answer => {
                        let flushed = self.buffer.trim_start().to_string();
                        self.buffer.clear();
                        if flushed.is_empty() {
                            None
                        } else {
                            Some(flushed)
                        }
                    }
                    _ => None,
                }
            }
        }
    }

    fn decide(&mut self) {
        let candidate = self.buffer.trim_start();
        if candidate.is_empty() {
            return;
        }
        let probe_len = candidate.len().min(ROUTE_KEYWORD.len());
        let probe = &candidate.as_bytes()[..probe_len];
        if !probe.eq_ignore_ascii_case(&ROUTE_KEYWORD.as_bytes()[..probe_len]) {
            self.decision = RouteDecision::Answer;
        } else if candidate.len() >= ROUTE_KEYWORD.len() {
            self.decision = RouteDecision::Script;
        }
        // Otherwise: a strict prefix of the keyword; keep buffering.
    }

    /// The stream is exhausted; interpret the complete reply.
    ///
    /// Returns the final route plus any buffered text that must still be
    /// shown (a short reply like `"scr"` is an answer whose characters were
    /// held back the whole time).
    pub fn finish(self, original_task: &str) -> (Route, Option<String>) {
        let route = interpret_reply(&self.full_reply, original_task);
        let leftover = match (&route, self.decision) {
            (Route::Answer(text), RouteDecision::Pending) => Some(text.clone()),
            _ => None,
        };
        (route, leftover)
    }
}

impl Default for StreamingRouteDecider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_with_task_block_routes_the_inner_task() {
        let route = interpret_reply(
            "script\n<task>\nsome task description\n</task>",
            "original",
        );
        assert_eq!(
            route,
            Route::Script {
                task: "some task description".to_string(),
                rewritten: true
            }
        );
    }

    #[test]
    fn script_without_task_block_keeps_the_original_task() {
        assert_eq!(
            interpret_reply("SCRIPT — go ahead", "original"),
            Route::Script {
                task: "original".to_string(),
                rewritten: false
            }
        );
        assert_eq!(
            interpret_reply("script", "original"),
            Route::Script {
                task: "original".to_string(),
                rewritten: false
            }
        );
    }

    #[test]
    fn whitespace_reply_routes_to_script() {
        assert_eq!(
            interpret_reply("   \n  ", "original"),
            Route::Script {
                task: "original".to_string(),
                rewritten: false
            }
        );
    }

    #[test]
    fn anything_else_is_an_answer() {
        assert_eq!(
            interpret_reply("  Plain answer with no script needed.  ", "original"),
            Route::Answer("Plain answer with no script needed.".to_string())
        );
        // A keyword later in the text does not trigger the script route.
        assert_eq!(
            interpret_reply("Here is a script for you", "original"),
            Route::Answer("Here is a script for you".to_string())
        );
    }

    #[test]
    fn streaming_never_leaks_the_routing_keyword() {
        let mut decider = StreamingRouteDecider::new();
        let mut emitted = String::new();
        for ch in "script\n<task>do it</task>".chars() {
            if let Some(chunk) = decider.push(&ch.to_string()) {
                emitted.push_str(&chunk);
            }
        }
        assert!(emitted.is_empty());
        assert_eq!(decider.decision(), RouteDecision::Script);

        let (route, leftover) = decider.finish("original");
        assert_eq!(
            route,
            Route::Script {
                task: "do it".to_string(),
                rewritten: true
            }
        );
        assert!(leftover.is_none());
    }

    #[test]
    fn streaming_answer_flushes_the_buffer_then_passes_through() {
        let mut decider = StreamingRouteDecider::new();
        let mut emitted = String::new();
        for ch in "Sure, here you go.".chars() {
            if let Some(chunk) = decider.push(&ch.to_string()) {
                emitted.push_str(&chunk);
            }
        }
        // "S" matches the keyword prefix so it is buffered; "u" settles it.
        assert_eq!(emitted, "Sure, here you go.");
        assert_eq!(decider.decision(), RouteDecision::Answer);
    }

    #[test]
    fn streaming_holds_back_keyword_prefixes() {
        let mut decider = StreamingRouteDecider::new();
        // Feed a reply that is a strict prefix of "script".
        for ch in "scr".chars() {
            assert!(decider.push(&ch.to_string()).is_none());
        }
        assert_eq!(decider.decision(), RouteDecision::Pending);

        let (route, leftover) = decider.finish("original");
        assert_eq!(route, Route::Answer("scr".to_string()));
        assert_eq!(leftover.as_deref(), Some("scr"));
    }

    #[test]
    fn streaming_case_insensitive_script_detection() {
        let mut decider = StreamingRouteDecider::new();
        for ch in "Script <task>x</task>".chars() {
            assert!(decider.push(&ch.to_string()).is_none());
        }
        assert_eq!(decider.decision(), RouteDecision::Script);
    }
}

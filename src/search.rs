//! Text search queries.
//!
//! A query is a list of terms that must all match:
//!
//! ```text
//! wiki engine          both words
//! "recent changes"     the phrase
//! sandbox -test        "sandbox" but not "test"
//! ```
//!
//! Matching is substring matching that ignores ASCII case only, the way
//! SQLite's `LOWER` and `LIKE` do: `ÜBER` finds `Über` but `über` does not.
//! The SQL engine turns a query into a `LIKE` clause
//! ([`TextQuery::sql_clause`]); the DBM engine evaluates it in memory ([`TextQuery::matches`]). `%`, `_` and `\` in
//! search terms are matched literally by both.

/// One search term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Term {
    /// Lowercased text to look for.
    pub text: String,
    /// True if the term must *not* occur.
    pub negated: bool,
}

/// A parsed search query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextQuery {
    terms: Vec<Term>,
}

impl TextQuery {
    /// Parses a search string. Never fails: unbalanced quotes run to the end
    /// of the input.
    pub fn parse(input: &str) -> Self {
        let mut terms = Vec::new();
        let mut chars = input.chars().peekable();
        loop {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            let Some(&first) = chars.peek() else {
                break;
            };

            let negated = first == '-';
            if negated {
                chars.next();
            }

            let mut text = String::new();
            if chars.next_if_eq(&'"').is_some() {
                for c in chars.by_ref() {
                    if c == '"' {
                        break;
                    }
                    text.push(c);
                }
            } else {
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    text.push(c);
                }
            }

            let text = text.trim().to_ascii_lowercase();
            if !text.is_empty() {
                terms.push(Term { text, negated });
            }
        }
        Self { terms }
    }

    /// The parsed terms.
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// True for a query without terms, which matches everything.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Evaluates the query against a page title and, for full-text search,
    /// its content.
    pub fn matches(&self, title: &str, content: Option<&str>) -> bool {
        let title = title.to_ascii_lowercase();
        let content = content.map(str::to_ascii_lowercase);
        self.terms.iter().all(|term| {
            let found = title.contains(&term.text)
                || content.as_deref().is_some_and(|c| c.contains(&term.text));
            found != term.negated
        })
    }

    /// Builds a SQL boolean expression for the query.
    ///
    /// `quote` must turn a string into a SQL literal (see
    /// [`SqlDriver::quote`](crate::driver::SqlDriver::quote)). Every pattern
    /// uses `ESCAPE '\'` so escaped wildcards in terms stay literal.
    pub fn sql_clause(
        &self,
        title_column: &str,
        content_column: Option<&str>,
        quote: impl Fn(&str) -> String,
    ) -> String {
        if self.terms.is_empty() {
            return "1 = 1".to_string();
        }
        let clauses: Vec<String> = self
            .terms
            .iter()
            .map(|term| {
                let pattern = quote(&format!("%{}%", escape_like(&term.text)));
                let mut expr = format!("LOWER({title_column}) LIKE {pattern} ESCAPE '\\'");
                if let Some(content) = content_column {
                    expr = format!("({expr} OR LOWER({content}) LIKE {pattern} ESCAPE '\\')");
                }
                if term.negated {
                    format!("NOT {expr}")
                } else {
                    expr
                }
            })
            .collect();
        clauses.join(" AND ")
    }
}

/// Escapes the `LIKE` wildcards `%` and `_` and the escape character `\`.
pub fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

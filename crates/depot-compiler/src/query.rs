//! Lightweight statement analysis.
//!
//! The generator does not need a full SQL parser. It needs to know the kind
//! of statement, where the bind parameters are, which tables are read or
//! written, and the names of the result columns. A tokenizer that understands
//! quoting, comments and parameters is enough for that.

/// A token kind.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Unquoted identifier or keyword.
    Word(String),
    /// Quoted identifier (`"x"`, `` `x` `` or `[x]`).
    Quoted(String),
    /// String or blob literal.
    Literal,
    /// Numeric literal.
    Number,
    /// Named parameter `:name`.
    Named(String),
    /// Positional parameter `?` or `?NNN`.
    Positional(Option<usize>),
    /// Any other character.
    Symbol(char),
}

/// A token with its byte range in the statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Kind.
    pub kind: TokenKind,
    /// Start byte offset.
    pub start: usize,
    /// End byte offset (exclusive).
    pub end: usize,
}

impl Token {
    fn is_word(&self, keyword: &str) -> bool {
        matches!(&self.kind, TokenKind::Word(w) if w.eq_ignore_ascii_case(keyword))
    }

    fn is_symbol(&self, c: char) -> bool {
        self.kind == TokenKind::Symbol(c)
    }

    fn identifier(&self) -> Option<&str> {
        match &self.kind {
            TokenKind::Word(w) | TokenKind::Quoted(w) => Some(w),
            _ => None,
        }
    }
}

struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    start: usize,
}

impl<'a> Lexer<'a> {
    const fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            start: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_next(&self) -> Option<char> {
        let mut chars = self.input[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            while self.peek().is_some_and(char::is_whitespace) {
                self.advance();
            }
            if self.peek() == Some('-') && self.peek_next() == Some('-') {
                while self.peek().is_some_and(|c| c != '\n') {
                    self.advance();
                }
                continue;
            }
            if self.peek() == Some('/') && self.peek_next() == Some('*') {
                self.advance();
                self.advance();
                loop {
                    match self.advance() {
                        Some('*') if self.peek() == Some('/') => {
                            self.advance();
                            break;
                        }
                        None => break,
                        _ => {}
                    }
                }
                continue;
            }
            break;
        }
    }

    fn make(&self, kind: TokenKind) -> Token {
        Token {
            kind,
            start: self.start,
            end: self.pos,
        }
    }

    fn scan_identifier(&mut self) -> String {
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$') {
            self.advance();
        }
        self.input[self.start..self.pos].to_string()
    }

    /// Scans up to the closing `close` character, treating a doubled closing
    /// character as an escape.
    fn scan_quoted(&mut self, close: char) -> Result<String, String> {
        self.advance();
        let mut content = String::new();
        loop {
            match self.advance() {
                Some(c) if c == close => {
                    if close != ']' && self.peek() == Some(close) {
                        self.advance();
                        content.push(close);
                    } else {
                        return Ok(content);
                    }
                }
                Some(c) => content.push(c),
                None => {
                    return Err(format!(
                        "unterminated quote starting at offset {}",
                        self.start
                    ))
                }
            }
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, String> {
        self.skip_whitespace_and_comments();
        self.start = self.pos;
        let Some(c) = self.peek() else {
            return Ok(None);
        };

        let kind = match c {
            '\'' => {
                self.scan_quoted('\'')?;
                TokenKind::Literal
            }
            'x' | 'X' if self.peek_next() == Some('\'') => {
                self.advance();
                self.scan_quoted('\'')?;
                TokenKind::Literal
            }
            '"' => TokenKind::Quoted(self.scan_quoted('"')?),
            '`' => TokenKind::Quoted(self.scan_quoted('`')?),
            '[' => TokenKind::Quoted(self.scan_quoted(']')?),
            ':' if self
                .peek_next()
                .is_some_and(|n| n.is_alphabetic() || n == '_') =>
            {
                self.advance();
                let name_start = self.pos;
                while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
                    self.advance();
                }
                TokenKind::Named(self.input[name_start..self.pos].to_string())
            }
            '?' => {
                self.advance();
                let digits_start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.advance();
                }
                TokenKind::Positional(self.input[digits_start..self.pos].parse().ok())
            }
            c if c.is_ascii_digit()
                || (c == '.' && self.peek_next().is_some_and(|n| n.is_ascii_digit())) =>
            {
                while self
                    .peek()
                    .is_some_and(|c| c.is_ascii_alphanumeric() || c == '.')
                {
                    self.advance();
                }
                TokenKind::Number
            }
            c if c.is_alphabetic() || c == '_' => TokenKind::Word(self.scan_identifier()),
            c => {
                self.advance();
                TokenKind::Symbol(c)
            }
        };
        Ok(Some(self.make(kind)))
    }
}

/// Kind of statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// `SELECT`, `VALUES` or a `WITH ... SELECT`.
    Select,
    /// `INSERT` or `REPLACE`.
    Insert,
    /// `UPDATE`.
    Update,
    /// `DELETE`.
    Delete,
    /// Anything else (DDL, pragmas).
    Other,
}

impl StatementKind {
    /// Whether the statement modifies data.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete)
    }
}

/// A table referenced in a `FROM` or `JOIN` clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// Table (or view) name.
    pub name: String,
    /// Alias, if any.
    pub alias: Option<String>,
}

/// A result column of a `SELECT`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultColumn {
    /// A named column (the alias, the column name, or the expression text).
    Named(String),
    /// `*` or `qualifier.*`.
    Star(Option<String>),
}

/// A piece of a statement, split at its bind parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal SQL.
    Sql(String),
    /// A `:name` parameter.
    Named(String),
    /// The n-th (0-based) positional parameter.
    Positional(usize),
}

const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "CROSS", "OUTER", "NATURAL", "ON",
    "USING", "GROUP", "ORDER", "LIMIT", "OFFSET", "HAVING", "UNION", "EXCEPT", "INTERSECT",
    "WINDOW", "SET", "VALUES", "SELECT", "DEFAULT", "RETURNING", "INDEXED", "NOT", "AS", "END",
];

fn is_clause_keyword(word: &str) -> bool {
    CLAUSE_KEYWORDS.iter().any(|k| k.eq_ignore_ascii_case(word))
}

/// A tokenized statement.
#[derive(Debug, Clone)]
pub struct AnalyzedQuery {
    sql: String,
    tokens: Vec<Token>,
}

impl AnalyzedQuery {
    /// Tokenizes a statement.
    ///
    /// Fails on unterminated quotes or literals.
    pub fn parse(sql: &str) -> Result<Self, String> {
        let mut lexer = Lexer::new(sql);
        let mut tokens = Vec::new();
        while let Some(token) = lexer.next_token()? {
            tokens.push(token);
        }
        Ok(Self {
            sql: sql.to_string(),
            tokens,
        })
    }

    /// Returns the statement text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Classifies the statement.
    #[must_use]
    pub fn kind(&self) -> StatementKind {
        let Some(first) = self.tokens.first() else {
            return StatementKind::Other;
        };
        if first.is_word("WITH") {
            return self
                .depth_zero()
                .find_map(|(_, t)| Self::classify(t))
                .unwrap_or(StatementKind::Other);
        }
        Self::classify(first).unwrap_or(StatementKind::Other)
    }

    fn classify(token: &Token) -> Option<StatementKind> {
        let TokenKind::Word(word) = &token.kind else {
            return None;
        };
        match word.to_ascii_uppercase().as_str() {
            "SELECT" | "VALUES" => Some(StatementKind::Select),
            "INSERT" | "REPLACE" => Some(StatementKind::Insert),
            "UPDATE" => Some(StatementKind::Update),
            "DELETE" => Some(StatementKind::Delete),
            _ => None,
        }
    }

    /// Iterates tokens outside any parentheses, with their index.
    fn depth_zero(&self) -> impl Iterator<Item = (usize, &Token)> {
        let mut depth = 0usize;
        self.tokens.iter().enumerate().filter(move |(_, t)| {
            if t.is_symbol('(') {
                depth += 1;
                return false;
            }
            if t.is_symbol(')') {
                depth = depth.saturating_sub(1);
                return false;
            }
            depth == 0
        })
    }

    /// Names of the `:name` parameters, in order of appearance.
    #[must_use]
    pub fn named_parameters(&self) -> Vec<String> {
        self.tokens
            .iter()
            .filter_map(|t| match &t.kind {
                TokenKind::Named(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of positional parameters.
    #[must_use]
    pub fn positional_count(&self) -> usize {
        self.tokens
            .iter()
            .filter(|t| matches!(t.kind, TokenKind::Positional(_)))
            .count()
    }

    /// Splits the statement at its bind parameters.
    #[must_use]
    pub fn segments(&self) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut cursor = 0;
        let mut positional = 0;
        for token in &self.tokens {
            let segment = match &token.kind {
                TokenKind::Named(name) => Segment::Named(name.clone()),
                TokenKind::Positional(number) => {
                    let index = number.map_or(positional, |n| n.saturating_sub(1));
                    positional += 1;
                    Segment::Positional(index)
                }
                _ => continue,
            };
            if token.start > cursor {
                segments.push(Segment::Sql(self.sql[cursor..token.start].to_string()));
            }
            segments.push(segment);
            cursor = token.end;
        }
        if cursor < self.sql.len() {
            segments.push(Segment::Sql(self.sql[cursor..].to_string()));
        }
        segments
    }

    /// Every table named after `FROM`, `JOIN`, `INTO` or `UPDATE`, in order,
    /// without duplicates. Use [`Self::written_table`] for the target of a
    /// write.
    #[must_use]
    pub fn tables(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for table in self.scan_tables(&["FROM", "JOIN", "INTO", "UPDATE"]) {
            if !out.iter().any(|t| t.eq_ignore_ascii_case(&table.name)) {
                out.push(table.name);
            }
        }
        out
    }

    /// The table a write statement modifies.
    ///
    /// Common table expressions in front of the statement are skipped, so
    /// `WITH old AS (SELECT id FROM a) DELETE FROM b ...` writes `b`.
    #[must_use]
    pub fn written_table(&self) -> Option<String> {
        let (start, verb) = self
            .depth_zero()
            .find(|(_, t)| Self::classify(t).is_some_and(StatementKind::is_write))?;
        let tokens = &self.tokens;
        let mut i = start + 1;
        // INSERT OR IGNORE / UPDATE OR ROLLBACK
        if tokens.get(i).is_some_and(|t| t.is_word("OR")) {
            i += 2;
        }
        if !verb.is_word("UPDATE") {
            let introducer = if verb.is_word("DELETE") { "FROM" } else { "INTO" };
            if !tokens.get(i).is_some_and(|t| t.is_word(introducer)) {
                return None;
            }
            i += 1;
        }
        let mut name = tokens.get(i).and_then(Token::identifier)?;
        if tokens.get(i + 1).is_some_and(|t| t.is_symbol('.')) {
            name = tokens.get(i + 2).and_then(Token::identifier)?;
        }
        Some(name.to_string())
    }

    /// Tables of the `FROM`/`JOIN` clauses with their aliases.
    #[must_use]
    pub fn table_refs(&self) -> Vec<TableRef> {
        self.scan_tables(&["FROM", "JOIN"])
    }

    fn scan_tables(&self, introducers: &[&str]) -> Vec<TableRef> {
        let tokens = &self.tokens;
        let mut out = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let introduced = introducers.iter().any(|k| tokens[i].is_word(k));
            i += 1;
            if !introduced {
                continue;
            }
            // UPDATE OR REPLACE t
            if tokens.get(i).is_some_and(|t| t.is_word("OR")) {
                i += 2;
            }
            loop {
                let Some(name) = tokens.get(i).and_then(Token::identifier) else {
                    break;
                };
                if is_clause_keyword(name) && matches!(tokens[i].kind, TokenKind::Word(_)) {
                    break;
                }
                let mut name = name.to_string();
                i += 1;
                if tokens.get(i).is_some_and(|t| t.is_symbol('.')) {
                    if let Some(qualified) = tokens.get(i + 1).and_then(Token::identifier) {
                        name = qualified.to_string();
                        i += 2;
                    }
                }
                let mut alias = None;
                if tokens.get(i).is_some_and(|t| t.is_word("AS")) {
                    alias = tokens.get(i + 1).and_then(Token::identifier).map(String::from);
                    i += 2;
                } else if let Some(candidate) = tokens.get(i).and_then(Token::identifier) {
                    let keyword = matches!(tokens[i].kind, TokenKind::Word(_))
                        && is_clause_keyword(candidate);
                    if !keyword {
                        alias = Some(candidate.to_string());
                        i += 1;
                    }
                }
                out.push(TableRef { name, alias });
                if tokens.get(i).is_some_and(|t| t.is_symbol(',')) {
                    i += 1;
                    continue;
                }
                break;
            }
        }
        out
    }

    /// Result columns of the outermost `SELECT`.
    ///
    /// Returns an empty list for statements that are not a `SELECT`.
    #[must_use]
    pub fn result_columns(&self) -> Vec<ResultColumn> {
        let Some(select) = self
            .depth_zero()
            .find(|(_, t)| t.is_word("SELECT"))
            .map(|(i, _)| i)
        else {
            return Vec::new();
        };

        let mut start = select + 1;
        if self
            .tokens
            .get(start)
            .is_some_and(|t| t.is_word("DISTINCT") || t.is_word("ALL"))
        {
            start += 1;
        }

        let mut items: Vec<Vec<&Token>> = vec![Vec::new()];
        let mut depth = 0usize;
        for token in &self.tokens[start..] {
            if depth == 0
                && (token.is_word("FROM")
                    || token.is_word("WHERE")
                    || token.is_word("UNION")
                    || token.is_word("ORDER")
                    || token.is_word("LIMIT")
                    || token.is_word("GROUP"))
            {
                break;
            }
            if token.is_symbol('(') {
                depth += 1;
            } else if token.is_symbol(')') {
                depth = depth.saturating_sub(1);
            } else if depth == 0 && token.is_symbol(',') {
                items.push(Vec::new());
                continue;
            }
            if let Some(item) = items.last_mut() {
                item.push(token);
            }
        }

        items
            .into_iter()
            .filter(|item| !item.is_empty())
            .map(|item| self.result_column(&item))
            .collect()
    }

    fn result_column(&self, item: &[&Token]) -> ResultColumn {
        let n = item.len();
        let last = item[n - 1];

        if last.is_symbol('*') {
            let qualifier = (n >= 3 && item[n - 2].is_symbol('.'))
                .then(|| item[n - 3].identifier().map(String::from))
                .flatten();
            return ResultColumn::Star(qualifier);
        }

        if let Some(name) = last.identifier() {
            if n >= 2 && item[n - 2].is_word("AS") {
                return ResultColumn::Named(name.to_string());
            }
            let previous = (n >= 2).then(|| item[n - 2]);
            let implicit_alias = previous.is_some_and(|p| {
                (p.identifier().is_some() || p.is_symbol(')') || p.kind == TokenKind::Literal)
                    && !last.is_word("END")
            });
            if n == 1 || previous.is_some_and(|p| p.is_symbol('.')) && n == 3 {
                return ResultColumn::Named(name.to_string());
            }
            if implicit_alias {
                return ResultColumn::Named(name.to_string());
            }
        }

        let start = item[0].start;
        let end = last.end;
        ResultColumn::Named(self.sql[start..end].trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(sql: &str) -> AnalyzedQuery {
        AnalyzedQuery::parse(sql).unwrap_or_else(|e| panic!("Failed to scan: {sql}\nError: {e}"))
    }

    fn names(columns: Vec<ResultColumn>) -> Vec<String> {
        columns
            .into_iter()
            .map(|c| match c {
                ResultColumn::Named(n) => n,
                ResultColumn::Star(None) => "*".to_string(),
                ResultColumn::Star(Some(q)) => format!("{q}.*"),
            })
            .collect()
    }

    #[test]
    fn test_kind() {
        assert_eq!(analyze("SELECT 1").kind(), StatementKind::Select);
        assert_eq!(
            analyze("WITH x AS (SELECT 1) DELETE FROM t").kind(),
            StatementKind::Delete
        );
        assert_eq!(analyze("replace into t values (1)").kind(), StatementKind::Insert);
        assert_eq!(analyze("PRAGMA user_version").kind(), StatementKind::Other);
    }

    #[test]
    fn test_named_parameters_skip_literals_and_comments() {
        let q = analyze(
            "SELECT * FROM t WHERE a = :a AND b = ':not' -- :nope\n AND c IN (:ids) /* :x */",
        );
        assert_eq!(q.named_parameters(), vec!["a", "ids"]);
        assert_eq!(q.positional_count(), 0);
    }

    #[test]
    fn test_segments() {
        let q = analyze("SELECT * FROM t WHERE id IN (:ids) AND name = :name");
        assert_eq!(
            q.segments(),
            vec![
                Segment::Sql("SELECT * FROM t WHERE id IN (".into()),
                Segment::Named("ids".into()),
                Segment::Sql(") AND name = ".into()),
                Segment::Named("name".into()),
            ]
        );
    }

    #[test]
    fn test_positional_segments() {
        let q = analyze("UPDATE t SET a = ? WHERE b = ?");
        assert_eq!(q.positional_count(), 2);
        assert!(q.segments().contains(&Segment::Positional(1)));
    }

    #[test]
    fn test_tables() {
        assert_eq!(
            analyze("SELECT * FROM word_table ORDER BY word ASC").tables(),
            vec!["word_table"]
        );
        assert_eq!(
            analyze("SELECT a.x FROM a JOIN `b` ON a.id = b.id WHERE 1").tables(),
            vec!["a", "b"]
        );
        assert_eq!(
            analyze("SELECT * FROM main.c AS cc, d").tables(),
            vec!["c", "d"]
        );
        assert_eq!(
            analyze("INSERT OR IGNORE INTO t (a) SELECT a FROM u").tables(),
            vec!["t", "u"]
        );
        assert_eq!(
            analyze("UPDATE OR REPLACE t SET a = 1").tables(),
            vec!["t"]
        );
        assert_eq!(
            analyze("DELETE FROM t WHERE id IN (SELECT id FROM u)").tables(),
            vec!["t", "u"]
        );
    }

    #[test]
    fn test_written_table() {
        assert_eq!(
            analyze("INSERT OR IGNORE INTO t (a) SELECT a FROM u").written_table(),
            Some("t".to_string())
        );
        assert_eq!(
            analyze("replace into main.t values (1)").written_table(),
            Some("t".to_string())
        );
        assert_eq!(
            analyze("UPDATE OR ROLLBACK \"t\" SET a = 1").written_table(),
            Some("t".to_string())
        );
        assert_eq!(
            analyze("WITH old AS (SELECT id FROM a WHERE x < 3) DELETE FROM b WHERE id IN old")
                .written_table(),
            Some("b".to_string())
        );
        assert_eq!(
            analyze("WITH RECURSIVE r(n) AS (SELECT 1 UNION SELECT n + 1 FROM r) INSERT INTO c SELECT n FROM r")
                .written_table(),
            Some("c".to_string())
        );
        assert_eq!(analyze("SELECT * FROM t").written_table(), None);
    }

    #[test]
    fn test_table_aliases() {
        let refs = analyze("SELECT w.* FROM word_table w JOIN other AS o ON 1").table_refs();
        assert_eq!(refs[0].alias.as_deref(), Some("w"));
        assert_eq!(refs[1].alias.as_deref(), Some("o"));
    }

    #[test]
    fn test_result_columns() {
        assert_eq!(
            names(analyze("SELECT * FROM t").result_columns()),
            vec!["*"]
        );
        assert_eq!(
            names(
                analyze("SELECT DISTINCT t.word, date AS d, count(*) n, upper(word) FROM t")
                    .result_columns()
            ),
            vec!["word", "d", "n", "upper(word)"]
        );
        assert_eq!(
            names(analyze("SELECT w.* FROM word_table w").result_columns()),
            vec!["w.*"]
        );
        assert_eq!(
            names(analyze("SELECT a - b FROM t").result_columns()),
            vec!["a - b"]
        );
        assert!(analyze("DELETE FROM t").result_columns().is_empty());
    }

    #[test]
    fn test_unterminated_literal() {
        assert!(AnalyzedQuery::parse("SELECT 'abc").is_err());
    }
}

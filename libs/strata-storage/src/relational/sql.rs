//! Statement builders for the `PostgreSQL` and `SQLite` dialects.
//!
//! Records live in one table per kind, `(id TEXT PRIMARY KEY, data JSONB)`
//! (`data` is JSON text on `SQLite`). Operands are always bound; path
//! segments are inlined as escaped string literals.

use strata_query::{CompareOp, FieldPath, Predicate, PreparedList, Scalar, SortDir};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

/// A bound statement parameter.
#[derive(Clone, Debug, PartialEq)]
pub enum Bind {
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// SQL text plus its parameters in placeholder order.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub binds: Vec<Bind>,
}

/// JSON type family of a comparison operand.
#[derive(Clone, Copy)]
enum Family {
    Number,
    String,
    Bool,
}

struct Builder {
    dialect: Dialect,
    binds: Vec<Bind>,
}

impl Builder {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            binds: Vec::new(),
        }
    }

    fn param(&mut self, bind: Bind) -> String {
        self.binds.push(bind);
        match self.dialect {
            Dialect::Postgres => format!("${}", self.binds.len()),
            Dialect::Sqlite => "?".to_owned(),
        }
    }

    fn finish(self, sql: String) -> Statement {
        Statement {
            sql,
            binds: self.binds,
        }
    }

    /// JSON node at `path` (`PostgreSQL` only).
    fn node(path: &FieldPath) -> String {
        path.segments()
            .iter()
            .fold("data".to_owned(), |acc, seg| format!("{acc}->{}", literal(seg)))
    }

    /// Leaf value at `path` as SQL text (`PostgreSQL`) or native SQL value (`SQLite`).
    fn leaf(&self, path: &FieldPath) -> String {
        match self.dialect {
            Dialect::Postgres => match path.segments().split_last() {
                Some((last, parents)) => {
                    let parent = parents
                        .iter()
                        .fold("data".to_owned(), |acc, seg| format!("{acc}->{}", literal(seg)));
                    format!("{parent}->>{}", literal(last))
                }
                None => "data".to_owned(),
            },
            Dialect::Sqlite => format!("data->>{}", sqlite_path(path)),
        }
    }

    fn type_of(&self, path: &FieldPath) -> String {
        match self.dialect {
            Dialect::Postgres => format!("jsonb_typeof({})", Self::node(path)),
            Dialect::Sqlite => format!("json_type(data, {})", sqlite_path(path)),
        }
    }

    fn guard(&self, path: &FieldPath, family: Family) -> String {
        let type_of = self.type_of(path);
        match (self.dialect, family) {
            (Dialect::Postgres, Family::Number) => format!("{type_of} = 'number'"),
            (Dialect::Postgres, Family::String) => format!("{type_of} = 'string'"),
            (Dialect::Postgres, Family::Bool) => format!("{type_of} = 'boolean'"),
            (Dialect::Sqlite, Family::Number) => format!("{type_of} IN ('integer', 'real')"),
            (Dialect::Sqlite, Family::String) => format!("{type_of} = 'text'"),
            (Dialect::Sqlite, Family::Bool) => format!("{type_of} IN ('true', 'false')"),
        }
    }

    fn operand(&self, path: &FieldPath, family: Family) -> String {
        match (self.dialect, family) {
            (Dialect::Postgres, Family::Number) => format!("({})::numeric", Self::node(path)),
            (Dialect::Postgres, Family::String) => format!("({}) COLLATE \"C\"", self.leaf(path)),
            (Dialect::Postgres, Family::Bool) => format!("({})::boolean", self.leaf(path)),
            (Dialect::Sqlite, _) => self.leaf(path),
        }
    }

    /// `CASE WHEN <type guard> THEN <test> ELSE FALSE END`, never `NULL`.
    fn guarded(guard: &str, test: &str) -> String {
        format!("CASE WHEN {guard} THEN {test} ELSE FALSE END")
    }

    fn predicate(&mut self, predicate: &Predicate) -> String {
        match predicate {
            Predicate::Absent(path) => format!("COALESCE({}, 'null') = 'null'", self.type_of(path)),
            Predicate::Compare {
                path,
                op: CompareOp::Ne,
                value,
            } => format!("NOT ({})", self.compare(path, CompareOp::Eq, value)),
            Predicate::Compare { path, op, value } => self.compare(path, *op, value),
            Predicate::Regex {
                path,
                pattern,
                negated,
            } => {
                let test = self.regex(path, pattern);
                if *negated {
                    format!("NOT ({test})")
                } else {
                    test
                }
            }
            Predicate::And(children) => self.join(children, " AND ", "TRUE"),
            Predicate::Or(children) => self.join(children, " OR ", "FALSE"),
            Predicate::Not(inner) => format!("NOT ({})", self.predicate(inner)),
        }
    }

    fn join(&mut self, children: &[Predicate], separator: &str, empty: &str) -> String {
        if children.is_empty() {
            return empty.to_owned();
        }
        let parts: Vec<String> = children.iter().map(|c| self.predicate(c)).collect();
        format!("({})", parts.join(separator))
    }

    fn compare(&mut self, path: &FieldPath, op: CompareOp, value: &Scalar) -> String {
        let (family, bind) = match value {
            Scalar::Bool(b) => (Family::Bool, Bind::Bool(*b)),
            Scalar::Number(n) => (
                Family::Number,
                n.as_i64()
                    .map_or_else(|| Bind::Float(n.as_f64().unwrap_or(f64::NAN)), Bind::Int),
            ),
            Scalar::String(s) => (Family::String, Bind::Text(s.clone())),
        };
        let guard = self.guard(path, family);
        let operand = self.operand(path, family);
        let param = self.param(bind);
        Self::guarded(&guard, &format!("{operand} {} {param}", sql_operator(op)))
    }

    fn regex(&mut self, path: &FieldPath, pattern: &str) -> String {
        let guard = self.guard(path, Family::String);
        let leaf = self.leaf(path);
        let test = match self.dialect {
            Dialect::Postgres => {
                let param = self.param(Bind::Text(pattern.to_owned()));
                format!("({leaf}) ~* {param}")
            }
            Dialect::Sqlite => {
                let param = self.param(Bind::Text(format!("(?i){pattern}")));
                format!("{leaf} REGEXP {param}")
            }
        };
        Self::guarded(&guard, &test)
    }

    fn where_clause(&mut self, predicate: Option<&Predicate>) -> String {
        predicate.map_or_else(String::new, |p| format!(" WHERE {}", self.predicate(p)))
    }

    /// Sort bucket of the value at `path`: absent, boolean, number, string,
    /// array, object.
    fn type_rank(&self, path: &FieldPath) -> String {
        let arms = match self.dialect {
            Dialect::Postgres => {
                "WHEN 'boolean' THEN 1 WHEN 'number' THEN 2 WHEN 'string' THEN 3 \
                 WHEN 'array' THEN 4 WHEN 'object' THEN 5"
            }
            Dialect::Sqlite => {
                "WHEN 'true' THEN 1 WHEN 'false' THEN 1 WHEN 'integer' THEN 2 WHEN 'real' THEN 2 \
                 WHEN 'text' THEN 3 WHEN 'array' THEN 4 WHEN 'object' THEN 5"
            }
        };
        format!("CASE {} {arms} ELSE 0 END", self.type_of(path))
    }

    /// Order keys: the type bucket, then the scalar value within its bucket.
    /// Arrays and objects only sort by bucket.
    fn order_keys(&self, path: &FieldPath) -> Vec<String> {
        let mut keys = vec![self.type_rank(path)];
        match self.dialect {
            Dialect::Postgres => {
                keys.extend([Family::Bool, Family::Number, Family::String].map(|family| {
                    format!(
                        "CASE WHEN {} THEN {} END",
                        self.guard(path, family),
                        self.operand(path, family)
                    )
                }));
            }
            // `->>` yields 0/1 for booleans, numbers and binary-collated text.
            Dialect::Sqlite => keys.push(format!(
                "CASE WHEN {} IN ('true', 'false', 'integer', 'real', 'text') THEN {} END",
                self.type_of(path),
                self.leaf(path)
            )),
        }
        keys
    }

    fn order_clause(&self, prepared: &PreparedList) -> String {
        let id = match self.dialect {
            Dialect::Postgres => "id COLLATE \"C\"",
            Dialect::Sqlite => "id",
        };
        let Some(order) = &prepared.order else {
            return format!(" ORDER BY {id}");
        };
        let direction = match order.direction {
            SortDir::Asc => "ASC",
            SortDir::Desc => "DESC",
        };
        let keys: Vec<String> = self
            .order_keys(&order.path)
            .into_iter()
            .map(|key| format!("{key} {direction}"))
            .collect();
        format!(" ORDER BY {}, {id}", keys.join(", "))
    }

    fn window_clause(&mut self, prepared: &PreparedList) -> String {
        let limit = prepared.limit.map(|l| i64::try_from(l).unwrap_or(i64::MAX));
        let offset = i64::try_from(prepared.offset).unwrap_or(i64::MAX);
        let mut clause = String::new();
        match (limit, self.dialect) {
            (Some(limit), _) => {
                let param = self.param(Bind::Int(limit));
                clause.push_str(" LIMIT ");
                clause.push_str(&param);
            }
            (None, Dialect::Sqlite) if offset > 0 => clause.push_str(" LIMIT -1"),
            (None, _) => {}
        }
        if offset > 0 {
            let param = self.param(Bind::Int(offset));
            clause.push_str(" OFFSET ");
            clause.push_str(&param);
        }
        clause
    }
}

fn sql_operator(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "=",
        CompareOp::Ne => "<>",
        CompareOp::Gt => ">",
        CompareOp::Lt => "<",
        CompareOp::Gte => ">=",
        CompareOp::Lte => "<=",
    }
}

/// Single-quoted SQL string literal.
fn literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// `'$."a"."b"'`
fn sqlite_path(path: &FieldPath) -> String {
    let json_path: String = path
        .segments()
        .iter()
        .map(|seg| format!(".\"{seg}\""))
        .collect();
    literal(&format!("${json_path}"))
}

fn table(kind: &str) -> String {
    format!("\"{kind}\"")
}

#[must_use]
pub fn create_table(dialect: Dialect, kind: &str) -> String {
    let data_type = match dialect {
        Dialect::Postgres => "JSONB",
        Dialect::Sqlite => "TEXT",
    };
    format!(
        "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, data {data_type} NOT NULL)",
        table(kind)
    )
}

#[must_use]
pub fn select_one(dialect: Dialect, kind: &str, id: &str) -> Statement {
    let mut builder = Builder::new(dialect);
    let data = match dialect {
        Dialect::Postgres => "data::text AS data",
        Dialect::Sqlite => "data",
    };
    let param = builder.param(Bind::Text(id.to_owned()));
    builder.finish(format!("SELECT {data} FROM {} WHERE id = {param}", table(kind)))
}

#[must_use]
pub fn upsert(dialect: Dialect, kind: &str, id: &str, data: String) -> Statement {
    let mut builder = Builder::new(dialect);
    let id = builder.param(Bind::Text(id.to_owned()));
    let data = builder.param(Bind::Text(data));
    let data = match dialect {
        Dialect::Postgres => format!("{data}::jsonb"),
        Dialect::Sqlite => data,
    };
    builder.finish(format!(
        "INSERT INTO {} (id, data) VALUES ({id}, {data}) ON CONFLICT (id) DO UPDATE SET data = excluded.data",
        table(kind)
    ))
}

#[must_use]
pub fn delete(dialect: Dialect, kind: &str, id: &str) -> Statement {
    let mut builder = Builder::new(dialect);
    let param = builder.param(Bind::Text(id.to_owned()));
    builder.finish(format!("DELETE FROM {} WHERE id = {param}", table(kind)))
}

/// `SELECT id, data FROM "{kind}" [WHERE ..] ORDER BY .. [LIMIT ..] [OFFSET ..]`
#[must_use]
pub fn select(dialect: Dialect, kind: &str, prepared: &PreparedList) -> Statement {
    let mut builder = Builder::new(dialect);
    let columns = match dialect {
        Dialect::Postgres => "id, data::text AS data",
        Dialect::Sqlite => "id, data",
    };
    let filter = builder.where_clause(prepared.predicate.as_ref());
    let order = builder.order_clause(prepared);
    let window = builder.window_clause(prepared);
    builder.finish(format!(
        "SELECT {columns} FROM {}{filter}{order}{window}",
        table(kind)
    ))
}

#[must_use]
pub fn count(dialect: Dialect, kind: &str, predicate: Option<&Predicate>) -> Statement {
    let mut builder = Builder::new(dialect);
    let filter = builder.where_clause(predicate);
    builder.finish(format!("SELECT COUNT(*) FROM {}{filter}", table(kind)))
}

//! The SQL parser: combinator grammar over the statement dialect.
//! Keywords are upper-case; identifiers are anything `text::ident`
//! accepts that is not a keyword.

use chumsky::prelude::*;
use strata::types::ColType;

use crate::common::CompOp;
use crate::value::{Value, DATETIME_LEN};

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable {
        table: String,
        cols: Vec<ColDef>,
    },
    DropTable {
        table: String,
    },
    CreateIndex {
        table: String,
        cols: Vec<String>,
    },
    DropIndex {
        table: String,
        cols: Vec<String>,
    },
    ShowTables,
    ShowIndex {
        table: String,
    },
    DescTable {
        table: String,
    },
    Insert {
        table: String,
        values: Vec<Value>,
    },
    Delete {
        table: String,
        conds: Vec<CondExpr>,
    },
    Update {
        table: String,
        sets: Vec<SetExpr>,
        conds: Vec<CondExpr>,
    },
    Select(Box<SelectStmt>),
    Begin,
    Commit,
    Abort,
    Rollback,
    Help,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColDef {
    pub name: String,
    pub col_type: ColType,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColRef {
    pub table: Option<String>,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RhsExpr {
    Lit(Value),
    Col(ColRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CondExpr {
    pub lhs: ColRef,
    pub op: CompOp,
    pub rhs: RhsExpr,
}

/// `col = literal` or the arithmetic form `col = col + literal`.
#[derive(Debug, Clone, PartialEq)]
pub struct SetExpr {
    pub column: String,
    pub rhs: Value,
    pub add: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AggKind {
    Count,
    Sum,
    Max,
    Min,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Wildcard,
    Col(ColRef),
    Agg {
        kind: AggKind,
        arg: Option<ColRef>,
        alias: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStmt {
    pub items: Vec<SelectItem>,
    pub tables: Vec<String>,
    pub conds: Vec<CondExpr>,
    pub order_by: Vec<(ColRef, bool)>,
    pub limit: Option<i64>,
}

pub fn parse_sql(input: &str) -> Result<Statement, Vec<Simple<char>>> {
    parser().parse(input)
}

fn parser() -> impl Parser<char, Statement, Error = Simple<char>> {
    let ident = text::ident()
        .padded()
        .try_map(|ident: String, span| match ident.to_uppercase().as_str() {
            "SELECT" | "FROM" | "WHERE" | "CREATE" | "DROP" | "TABLE" | "INDEX" | "INSERT"
            | "INTO" | "VALUES" | "DELETE" | "UPDATE" | "SET" | "SHOW" | "TABLES" | "ORDER"
            | "BY" | "LIMIT" | "AND" | "AS" | "ASC" | "DESC" | "BEGIN" | "COMMIT" | "ABORT"
            | "ROLLBACK" | "HELP" | "INT" | "BIGINT" | "FLOAT" | "CHAR" | "DATETIME" => {
                Err(Simple::custom(
                    span,
                    format!("keyword `{}` cannot be used as an identifier", ident),
                ))
            }
            _ => Ok(ident),
        });

    let number = just('-')
        .or_not()
        .chain::<char, _, _>(text::int(10))
        .chain::<char, _, _>(just('.').chain(text::digits(10)).or_not().flatten())
        .collect::<String>()
        .try_map(|s: String, span| {
            if s.contains('.') {
                s.parse::<f32>()
                    .map(Value::Float)
                    .map_err(|_| Simple::custom(span, format!("invalid float literal: {s}")))
            } else if let Ok(v) = s.parse::<i32>() {
                Ok(Value::Int(v))
            } else {
                s.parse::<i64>()
                    .map(Value::BigInt)
                    .map_err(|_| Simple::custom(span, format!("integer literal overflows: {s}")))
            }
        })
        .padded();

    let string = just('\'')
        .ignore_then(filter(|c| *c != '\'').repeated())
        .then_ignore(just('\''))
        .collect::<String>()
        .map(Value::Str)
        .padded();

    let literal = number.or(string);

    let col_ref = ident
        .then(just('.').ignore_then(ident).or_not())
        .map(|(first, second)| match second {
            Some(column) => ColRef {
                table: Some(first),
                column,
            },
            None => ColRef {
                table: None,
                column: first,
            },
        });

    let comp_op = choice((
        just("<=").to(CompOp::Le),
        just(">=").to(CompOp::Ge),
        just("<>").to(CompOp::Ne),
        just("!=").to(CompOp::Ne),
        just('=').to(CompOp::Eq),
        just('<').to(CompOp::Lt),
        just('>').to(CompOp::Gt),
    ))
    .padded();

    let condition = col_ref
        .clone()
        .then(comp_op)
        .then(literal.clone().map(RhsExpr::Lit).or(col_ref.clone().map(RhsExpr::Col)))
        .map(|((lhs, op), rhs)| CondExpr { lhs, op, rhs });

    let where_clause = text::keyword("WHERE")
        .padded()
        .ignore_then(
            condition
                .clone()
                .separated_by(text::keyword("AND").padded())
                .at_least(1),
        )
        .or_not()
        .map(Option::unwrap_or_default);

    let data_type = choice((
        text::keyword("INT").to((ColType::Int, 4usize)),
        text::keyword("BIGINT").to((ColType::BigInt, 8usize)),
        text::keyword("FLOAT").to((ColType::Float, 4usize)),
        text::keyword("DATETIME").to((ColType::Datetime, DATETIME_LEN)),
        text::keyword("CHAR").padded().ignore_then(
            text::int(10)
                .padded()
                .try_map(|n: String, span| {
                    n.parse::<usize>()
                        .map_err(|_| Simple::custom(span, format!("invalid CHAR width: {n}")))
                })
                .delimited_by(just('(').padded(), just(')').padded())
                .map(|n| (ColType::String, n)),
        ),
    ))
    .padded();

    let col_def = ident.then(data_type).map(|(name, (col_type, len))| ColDef {
        name,
        col_type,
        len,
    });

    let create_table = text::keyword("CREATE")
        .padded()
        .ignore_then(text::keyword("TABLE").padded())
        .ignore_then(ident)
        .then(
            col_def
                .separated_by(just(',').padded())
                .at_least(1)
                .delimited_by(just('(').padded(), just(')').padded()),
        )
        .map(|(table, cols)| Statement::CreateTable { table, cols });

    let drop_table = text::keyword("DROP")
        .padded()
        .ignore_then(text::keyword("TABLE").padded())
        .ignore_then(ident)
        .map(|table| Statement::DropTable { table });

    let col_name_list = ident
        .separated_by(just(',').padded())
        .at_least(1)
        .delimited_by(just('(').padded(), just(')').padded());

    let create_index = text::keyword("CREATE")
        .padded()
        .ignore_then(text::keyword("INDEX").padded())
        .ignore_then(ident)
        .then(col_name_list.clone())
        .map(|(table, cols)| Statement::CreateIndex { table, cols });

    let drop_index = text::keyword("DROP")
        .padded()
        .ignore_then(text::keyword("INDEX").padded())
        .ignore_then(ident)
        .then(col_name_list)
        .map(|(table, cols)| Statement::DropIndex { table, cols });

    let show_tables = text::keyword("SHOW")
        .padded()
        .ignore_then(text::keyword("TABLES").padded())
        .to(Statement::ShowTables);

    let show_index = text::keyword("SHOW")
        .padded()
        .ignore_then(text::keyword("INDEX").padded())
        .ignore_then(text::keyword("FROM").padded())
        .ignore_then(ident)
        .map(|table| Statement::ShowIndex { table });

    let desc_table = text::keyword("DESC")
        .padded()
        .ignore_then(ident)
        .map(|table| Statement::DescTable { table });

    let insert = text::keyword("INSERT")
        .padded()
        .ignore_then(text::keyword("INTO").padded())
        .ignore_then(ident)
        .then_ignore(text::keyword("VALUES").padded())
        .then(
            literal
                .clone()
                .separated_by(just(',').padded())
                .at_least(1)
                .delimited_by(just('(').padded(), just(')').padded()),
        )
        .map(|(table, values)| Statement::Insert { table, values });

    let delete = text::keyword("DELETE")
        .padded()
        .ignore_then(text::keyword("FROM").padded())
        .ignore_then(ident)
        .then(where_clause.clone())
        .map(|(table, conds)| Statement::Delete { table, conds });

    let set_clause = ident
        .then_ignore(just('=').padded())
        .then(
            literal.clone().map(|v| (None, v)).or(ident
                .then_ignore(just('+').padded())
                .then(literal.clone())
                .map(|(col, v)| (Some(col), v))),
        )
        .try_map(|(column, (add_col, rhs)), span| {
            if let Some(add_col) = &add_col {
                if *add_col != column {
                    return Err(Simple::custom(
                        span,
                        "arithmetic SET must reference the assigned column",
                    ));
                }
            }
            Ok(SetExpr {
                column,
                rhs,
                add: add_col.is_some(),
            })
        });

    let update = text::keyword("UPDATE")
        .padded()
        .ignore_then(ident)
        .then_ignore(text::keyword("SET").padded())
        .then(set_clause.separated_by(just(',').padded()).at_least(1))
        .then(where_clause.clone())
        .map(|((table, sets), conds)| Statement::Update { table, sets, conds });

    let agg_kind = choice((
        text::keyword("COUNT").to(AggKind::Count),
        text::keyword("SUM").to(AggKind::Sum),
        text::keyword("MAX").to(AggKind::Max),
        text::keyword("MIN").to(AggKind::Min),
    ))
    .padded();

    let agg_item = agg_kind
        .then(
            just('*')
                .padded()
                .to(None)
                .or(col_ref.clone().map(Some))
                .delimited_by(just('(').padded(), just(')').padded()),
        )
        .then(text::keyword("AS").padded().ignore_then(ident).or_not())
        .try_map(|((kind, arg), alias), span| {
            if arg.is_none() && kind != AggKind::Count {
                return Err(Simple::custom(span, "only COUNT accepts *"));
            }
            Ok(SelectItem::Agg { kind, arg, alias })
        });

    let select_item = just('*')
        .padded()
        .to(SelectItem::Wildcard)
        .or(agg_item)
        .or(col_ref.clone().map(SelectItem::Col));

    let order_by = text::keyword("ORDER")
        .padded()
        .ignore_then(text::keyword("BY").padded())
        .ignore_then(
            col_ref
                .clone()
                .then(
                    text::keyword("DESC")
                        .padded()
                        .to(true)
                        .or(text::keyword("ASC").padded().to(false))
                        .or_not()
                        .map(|desc| desc.unwrap_or(false)),
                )
                .separated_by(just(',').padded())
                .at_least(1),
        )
        .or_not()
        .map(Option::unwrap_or_default);

    let limit = text::keyword("LIMIT")
        .padded()
        .ignore_then(text::int(10).padded().try_map(|n: String, span| {
            n.parse::<i64>()
                .map_err(|_| Simple::custom(span, format!("invalid LIMIT value: {n}")))
        }))
        .or_not();

    let select = text::keyword("SELECT")
        .padded()
        .ignore_then(select_item.separated_by(just(',').padded()).at_least(1))
        .then_ignore(text::keyword("FROM").padded())
        .then(ident.separated_by(just(',').padded()).at_least(1))
        .then(where_clause)
        .then(order_by)
        .then(limit)
        .map(|((((items, tables), conds), order_by), limit)| {
            Statement::Select(Box::new(SelectStmt {
                items,
                tables,
                conds,
                order_by,
                limit,
            }))
        });

    let simple = choice((
        text::keyword("BEGIN").to(Statement::Begin),
        text::keyword("COMMIT").to(Statement::Commit),
        text::keyword("ABORT").to(Statement::Abort),
        text::keyword("ROLLBACK").to(Statement::Rollback),
        text::keyword("HELP").to(Statement::Help),
    ))
    .padded();

    choice((
        create_table,
        create_index,
        drop_table,
        drop_index,
        show_tables,
        show_index,
        desc_table,
        insert,
        delete,
        update,
        select,
        simple,
    ))
    .then_ignore(just(';').padded().or_not())
    .then_ignore(end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_create_table_with_all_types() {
        let stmt = parse_sql(
            "CREATE TABLE t (id INT, big BIGINT, f FLOAT, name CHAR(8), ts DATETIME);",
        )
        .unwrap();
        match stmt {
            Statement::CreateTable { table, cols } => {
                assert_eq!(table, "t");
                assert_eq!(cols.len(), 5);
                assert_eq!(cols[3].col_type, ColType::String);
                assert_eq!(cols[3].len, 8);
                assert_eq!(cols[4].len, DATETIME_LEN);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_insert_literals() {
        let stmt = parse_sql("INSERT INTO t VALUES (1, -2.5, 'abc', 3000000000);").unwrap();
        match stmt {
            Statement::Insert { values, .. } => {
                assert_eq!(
                    values,
                    vec![
                        Value::Int(1),
                        Value::Float(-2.5),
                        Value::Str("abc".into()),
                        Value::BigInt(3000000000),
                    ]
                );
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_select_with_conditions_order_and_limit() {
        let stmt =
            parse_sql("SELECT t.id, name FROM t, s WHERE t.id = s.id AND name <> 'x' ORDER BY id DESC LIMIT 10;")
                .unwrap();
        match stmt {
            Statement::Select(sel) => {
                assert_eq!(sel.tables, vec!["t", "s"]);
                assert_eq!(sel.items.len(), 2);
                assert_eq!(sel.conds.len(), 2);
                assert_eq!(sel.conds[0].op, CompOp::Eq);
                assert!(matches!(sel.conds[1].rhs, RhsExpr::Lit(Value::Str(_))));
                assert_eq!(sel.order_by.len(), 1);
                assert!(sel.order_by[0].1);
                assert_eq!(sel.limit, Some(10));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_aggregates() {
        let stmt = parse_sql("SELECT COUNT(*) AS cnt, SUM(score) FROM t;").unwrap();
        match stmt {
            Statement::Select(sel) => {
                assert!(matches!(
                    &sel.items[0],
                    SelectItem::Agg {
                        kind: AggKind::Count,
                        arg: None,
                        alias: Some(a)
                    } if a == "cnt"
                ));
                assert!(matches!(
                    &sel.items[1],
                    SelectItem::Agg {
                        kind: AggKind::Sum,
                        arg: Some(_),
                        alias: None
                    }
                ));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn parses_update_arithmetic_set() {
        let stmt = parse_sql("UPDATE t SET score = score + 5, name = 'y' WHERE id = 3;").unwrap();
        match stmt {
            Statement::Update { sets, conds, .. } => {
                assert!(sets[0].add);
                assert_eq!(sets[0].rhs, Value::Int(5));
                assert!(!sets[1].add);
                assert_eq!(conds.len(), 1);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(parse_sql("UPDATE t SET a = b + 1;").is_err());
    }

    #[test]
    fn parses_index_ddl_and_utilities() {
        assert_eq!(
            parse_sql("CREATE INDEX t (id, name);").unwrap(),
            Statement::CreateIndex {
                table: "t".into(),
                cols: vec!["id".into(), "name".into()]
            }
        );
        assert_eq!(
            parse_sql("DROP INDEX t (id);").unwrap(),
            Statement::DropIndex {
                table: "t".into(),
                cols: vec!["id".into()]
            }
        );
        assert_eq!(parse_sql("SHOW TABLES;").unwrap(), Statement::ShowTables);
        assert_eq!(
            parse_sql("SHOW INDEX FROM t;").unwrap(),
            Statement::ShowIndex { table: "t".into() }
        );
        assert_eq!(
            parse_sql("DESC t;").unwrap(),
            Statement::DescTable { table: "t".into() }
        );
        assert_eq!(parse_sql("BEGIN;").unwrap(), Statement::Begin);
        assert_eq!(parse_sql("COMMIT;").unwrap(), Statement::Commit);
        assert_eq!(parse_sql("ABORT;").unwrap(), Statement::Abort);
    }

    #[test]
    fn rejects_keywords_as_identifiers_and_garbage() {
        assert!(parse_sql("SELECT * FROM WHERE;").is_err());
        assert!(parse_sql("CREATE TABLE (id INT);").is_err());
        assert!(parse_sql("definitely not sql").is_err());
    }
}

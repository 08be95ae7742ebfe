//! Splitting CQL scripts into individually executable statements

/// Split a CQL script on `;` statement terminators
///
/// Comments (`--`, `//` and `/* ... */`) are dropped. Terminators inside single-quoted
/// strings, double-quoted identifiers and `$$ ... $$` blocks (user-defined function
/// bodies) do not end a statement. A trailing statement without `;` is kept.
pub fn split_statements(script: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut chars = script.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                current.push(c);
                // A doubled quote closes the literal and immediately reopens it
                for inner in chars.by_ref() {
                    current.push(inner);
                    if inner == c {
                        break;
                    }
                }
            }
            '$' if chars.peek() == Some(&'$') => {
                chars.next();
                current.push_str("$$");
                let mut previous_dollar = false;
                for inner in chars.by_ref() {
                    current.push(inner);
                    if inner == '$' && previous_dollar {
                        break;
                    }
                    previous_dollar = inner == '$';
                }
            }
            '-' if chars.peek() == Some(&'-') => skip_line(&mut chars, &mut current),
            '/' if chars.peek() == Some(&'/') => skip_line(&mut chars, &mut current),
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous_star = false;
                for inner in chars.by_ref() {
                    if inner == '/' && previous_star {
                        break;
                    }
                    previous_star = inner == '*';
                }
                current.push(' ');
            }
            ';' => push_statement(&mut statements, &mut current),
            _ => current.push(c),
        }
    }
    push_statement(&mut statements, &mut current);

    statements
}

fn skip_line(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, current: &mut String) {
    for inner in chars.by_ref() {
        if inner == '\n' {
            current.push('\n');
            break;
        }
    }
}

fn push_statement(statements: &mut Vec<String>, current: &mut String) {
    let statement = current.trim();
    if !statement.is_empty() {
        statements.push(statement.to_string());
    }
    current.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_simple_statements() {
        let script = "CREATE KEYSPACE ks WITH replication = {'class': 'SimpleStrategy', 'replication_factor': 1};\n\
                      CREATE TABLE ks.users (id uuid PRIMARY KEY, name text);\n";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE KEYSPACE ks"));
        assert_eq!(statements[1], "CREATE TABLE ks.users (id uuid PRIMARY KEY, name text)");
    }

    #[test]
    fn test_comments_are_removed() {
        let script = "-- leading comment; not a statement\n\
                      // another; comment\n\
                      /* block; comment */ INSERT INTO ks.t (k) VALUES (1); -- trailing\n\
                      SELECT * FROM ks.t";
        let statements = split_statements(script);
        assert_eq!(
            statements,
            vec!["INSERT INTO ks.t (k) VALUES (1)", "SELECT * FROM ks.t"]
        );
    }

    #[test]
    fn test_semicolons_inside_literals() {
        let script = "INSERT INTO ks.t (k, v) VALUES ('a;b', 'it''s;fine');\n\
                      SELECT \"weird;col\" FROM ks.t;";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "INSERT INTO ks.t (k, v) VALUES ('a;b', 'it''s;fine')");
        assert_eq!(statements[1], "SELECT \"weird;col\" FROM ks.t");
    }

    #[test]
    fn test_dollar_quoted_function_body() {
        let script = "CREATE FUNCTION ks.f (x int) RETURNS NULL ON NULL INPUT RETURNS int \
                      LANGUAGE java AS $$ int y = x; return y; $$;\nDROP TABLE ks.old;";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].ends_with("$$ int y = x; return y; $$"));
        assert_eq!(statements[1], "DROP TABLE ks.old");
    }

    #[test]
    fn test_empty_and_comment_only_scripts() {
        assert!(split_statements("").is_empty());
        assert!(split_statements("  ;;\n -- nothing here\n").is_empty());
    }
}

use crate::layout;
use anyhow::{bail, Result};
use quarry_schema::schema::Provider;
use std::fmt::{self, Write};

/// Helper struct for generating SQL statements.
#[derive(Debug)]
pub struct SqlWriter {
    provider: Provider,
    text: String,
}

impl SqlWriter {
    pub fn new(provider: Provider) -> Self {
        Self { provider, text: String::new() }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Overloaded helper method that calls a `write_*` method depending on the type `T`.
    pub fn write<T: WriteSql + ?Sized>(&mut self, x: &T) {
        x.write_sql(self);
    }

    /// Appends the string verbatim into the SQL statement.
    pub fn write_str(&mut self, x: &str) {
        self.text.push_str(x);
    }

    /// Appends the name as a quoted identifier into the SQL statement.
    pub fn write_name(&mut self, name: &layout::Name) {
        self.write_ident(&name.0);
    }

    pub fn write_ident(&mut self, name: &str) {
        let quote = match self.provider {
            Provider::MySql => '`',
            _ => '"',
        };
        self.text.reserve(2 + name.len());
        self.text.push(quote);
        for c in name.chars() {
            if c == quote {
                self.text.push(quote);
                self.text.push(quote);
            } else {
                self.text.push(c);
            }
        }
        self.text.push(quote);
    }

    /// Appends a parameter with given **zero-based** index into the SQL
    /// statement.
    ///
    /// This uses the correct syntax depending on the database (`?n` for
    /// SQLite, `$n` for Postgres, bare positional `?` for MySQL). The `idx`
    /// is zero-based, but the SQL parameter syntax is one-based, so an `idx`
    /// of 0 produces `?1` (or `$1`). MySQL parameters are purely positional:
    /// they must be written in bind order.
    pub fn write_param(&mut self, idx: usize) {
        match self.provider {
            Provider::Sqlite => write!(self, "?{}", idx + 1),
            Provider::Postgres => write!(self, "${}", idx + 1),
            Provider::MySql => self.write_str("?"),
        }
    }

    /// Appends a literal string into the SQL statement.
    pub fn write_literal_str(&mut self, value: &str) -> Result<()> {
        self.text.reserve(2 + value.len());
        self.text.push('\'');
        for c in value.chars() {
            if c == '\'' {
                self.text.push_str("''");
            } else if c == '\\' && self.provider == Provider::MySql {
                // MySQL treats backslash as an escape character inside
                // string literals.
                self.text.push_str("\\\\");
            } else if c == '\0' {
                bail!("cannot insert a NUL byte into a SQL literal string")
            } else {
                self.text.push(c);
            }
        }
        self.text.push('\'');
        Ok(())
    }

    /// Appends a literal float into the SQL statement.
    pub fn write_literal_f64(&mut self, value: f64) -> Result<()> {
        if value.is_finite() {
            write!(self, "{}", value);
        } else if value.is_infinite() {
            match (self.provider, value.is_sign_positive()) {
                // impossibly large values are parsed as infinity in SQLite
                (Provider::Sqlite, true) => self.write("9e999"),
                (Provider::Sqlite, false) => self.write("-9e999"),
                (Provider::Postgres, true) => self.write("CAST('inf' AS double precision)"),
                (Provider::Postgres, false) => self.write("CAST('-inf' AS double precision)"),
                (Provider::MySql, _) => bail!("MySQL cannot represent an infinite double"),
            }
        } else {
            bail!("cannot use NaN as a SQL literal")
        }
        Ok(())
    }

    pub fn write_literal_i64(&mut self, value: i64) {
        write!(self, "{}", value);
    }

    /// Booleans are stored as integer columns on every provider, so the
    /// literal form is 1/0.
    pub fn write_literal_bool(&mut self, value: bool) {
        self.write_str(if value { "1" } else { "0" });
    }

    /// This method makes the `write!` macro work with this struct.
    pub fn write_fmt(&mut self, fmt: fmt::Arguments<'_>) {
        self.text.write_fmt(fmt).expect("formatting failed")
    }

    /// Returns the produced SQL statement.
    pub fn build(self) -> String {
        self.text
    }
}

pub trait WriteSql {
    fn write_sql(&self, writer: &mut SqlWriter);
}

impl WriteSql for str {
    fn write_sql(&self, writer: &mut SqlWriter) {
        writer.write_str(self);
    }
}

impl WriteSql for String {
    fn write_sql(&self, writer: &mut SqlWriter) {
        writer.write_str(self);
    }
}

impl WriteSql for layout::Name {
    fn write_sql(&self, writer: &mut SqlWriter) {
        writer.write_name(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_per_provider() {
        let mut w = SqlWriter::new(Provider::Sqlite);
        w.write_ident("a\"b");
        assert_eq!(w.build(), "\"a\"\"b\"");

        let mut w = SqlWriter::new(Provider::MySql);
        w.write_ident("a`b");
        assert_eq!(w.build(), "`a``b`");
    }

    #[test]
    fn params_per_provider() {
        for (provider, expected) in [
            (Provider::Sqlite, "?1 ?2"),
            (Provider::Postgres, "$1 $2"),
            (Provider::MySql, "? ?"),
        ] {
            let mut w = SqlWriter::new(provider);
            w.write_param(0);
            w.write_str(" ");
            w.write_param(1);
            assert_eq!(w.build(), expected);
        }
    }

    #[test]
    fn string_literals_escape_quotes() {
        let mut w = SqlWriter::new(Provider::Sqlite);
        w.write_literal_str("it's").unwrap();
        assert_eq!(w.build(), "'it''s'");

        let mut w = SqlWriter::new(Provider::Sqlite);
        assert!(w.write_literal_str("nul\0byte").is_err());
    }
}

use crate::driver::Lexicon;

/// Postgres quoting rules
#[derive(Debug, Default, Clone, Copy)]
pub struct PgLexicon;

impl Lexicon for PgLexicon {
    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn quote_literal(&self, value: &str) -> String {
        if value.contains('\\') {
            // E'' form, so backslashes mean the same with or without
            // standard_conforming_strings
            format!("E'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
        } else {
            format!("'{}'", value.replace('\'', "''"))
        }
    }
}

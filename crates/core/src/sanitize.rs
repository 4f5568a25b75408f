/// Strip NUL and other low control bytes before sending text to the
/// embedding provider. Raw control characters corrupt downstream storage and
/// search; newlines and tabs are ordinary document structure and stay.
pub fn strip_control_chars(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

/// Reduce a search query to alphanumerics and whitespace for the full-text
/// engine. Punctuation is stripped rather than escaped so user input can
/// never smuggle FTS operators.
pub fn sanitize_search_query(query: &str) -> String {
    query
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .trim()
        .to_string()
}

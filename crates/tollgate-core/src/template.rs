//! Bucket-key templates: `${field}` substitution against a closed set of scope fields.
//!
//! `"${clientName}:${operation}:${model}"` renders to `"llm:chat:gpt-4o"`. Fields
//! without a value render as [`MISSING_VALUE`]. Text outside placeholders,
//! including lone `$` and `{`, is copied verbatim.

use crate::error::TemplateError;
use crate::scope::Scope;

pub const MISSING_VALUE: &str = "-";

pub fn render(template: &str, scope: &Scope) -> Result<String, TemplateError> {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        rendered.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| TemplateError::Unterminated {
            template: template.to_string(),
        })?;

        let field = after[..end].trim();
        if field.is_empty() {
            return Err(TemplateError::EmptyField {
                template: template.to_string(),
            });
        }

        let value = scope.field(field)?;
        rendered.push_str(value.as_deref().unwrap_or(MISSING_VALUE));
        rest = &after[end + 1..];
    }

    rendered.push_str(rest);
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::HttpRequestOptions;
    use crate::scope::EXT_AI_MODEL;

    fn scope() -> Scope {
        let request = HttpRequestOptions::get("https://api.example.com/v1/chat")
            .with_operation("chat")
            .with_extension(EXT_AI_MODEL, "gpt-4o")
            .with_extension("region", "eu");
        Scope::from_request("llm", &request).expect("valid scope")
    }

    #[test]
    fn renders_fields_and_literals() {
        let key = render("${clientName}:${operation}:${model}", &scope()).expect("renders");
        assert_eq!(key, "llm:chat:gpt-4o");
    }

    #[test]
    fn template_without_placeholders_is_unchanged() {
        assert_eq!(render("demo:rps", &scope()).expect("renders"), "demo:rps");
        assert_eq!(render("cost$ {x}", &scope()).expect("renders"), "cost$ {x}");
    }

    #[test]
    fn unset_field_renders_placeholder_value() {
        let key = render("${tenantId}/${ext.region}", &scope()).expect("renders");
        assert_eq!(key, "-/eu");
    }

    #[test]
    fn malformed_templates_are_errors() {
        assert!(matches!(
            render("${clientName", &scope()),
            Err(TemplateError::Unterminated { .. })
        ));
        assert!(matches!(
            render("${ }", &scope()),
            Err(TemplateError::EmptyField { .. })
        ));
        assert_eq!(
            render("${secret}", &scope()),
            Err(TemplateError::UnknownField {
                field: String::from("secret")
            })
        );
    }
}

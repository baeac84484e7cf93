use minijinja::{context, Environment};

pub struct AutoReplyContext<'a> {
    pub organization_name: &'a str,
    pub contact_name: Option<&'a str>,
    pub protocol_number: &'a str,
}

/// Renders an organization's auto-reply. Plain text passes through untouched;
/// a template that fails to parse or render falls back to its raw source.
pub fn render_auto_reply(template: &str, ctx: &AutoReplyContext<'_>) -> String {
    let mut env = Environment::new();
    if env.add_template("auto_reply", template).is_err() {
        return fallback_auto_reply(template);
    }

    let Ok(compiled) = env.get_template("auto_reply") else {
        return fallback_auto_reply(template);
    };

    compiled
        .render(context! {
            organization_name => ctx.organization_name,
            contact_name => ctx.contact_name.unwrap_or(""),
            protocol_number => ctx.protocol_number,
        })
        .map(|rendered| rendered.trim().to_string())
        .unwrap_or_else(|_| fallback_auto_reply(template))
}

fn fallback_auto_reply(template: &str) -> String {
    template.trim().to_string()
}

use minijinja::{context, Environment, UndefinedBehavior};

const TEMPLATE_NAME: &str = "broadcast";

pub struct RecipientContext<'a> {
    pub name: &'a str,
    pub phone: &'a str,
}

impl RecipientContext<'_> {
    fn first_name(&self) -> &str {
        self.name.split_whitespace().next().unwrap_or("")
    }
}

fn environment(source: &str) -> Result<Environment<'_>, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Lenient);
    env.add_template(TEMPLATE_NAME, source)?;
    Ok(env)
}

/// Rejects templates that do not parse, with the parser's message.
pub fn validate_template(source: &str) -> Result<(), String> {
    if source.trim().is_empty() {
        return Err("template must not be empty".to_string());
    }
    environment(source).map(|_| ()).map_err(|err| err.to_string())
}

pub fn render_broadcast(source: &str, recipient: &RecipientContext<'_>) -> String {
    let Ok(env) = environment(source) else {
        return fallback_render(source, recipient);
    };
    let Ok(template) = env.get_template(TEMPLATE_NAME) else {
        return fallback_render(source, recipient);
    };

    template
        .render(context! {
            name => recipient.name,
            first_name => recipient.first_name(),
            phone => recipient.phone,
        })
        .map(|text| text.trim().to_string())
        .unwrap_or_else(|_| fallback_render(source, recipient))
}

fn fallback_render(source: &str, recipient: &RecipientContext<'_>) -> String {
    let mut text = source.to_string();
    for (key, value) in [
        ("first_name", recipient.first_name()),
        ("name", recipient.name),
        ("phone", recipient.phone),
    ] {
        text = text
            .replace(&format!("{{{{ {key} }}}}"), value)
            .replace(&format!("{{{{{key}}}}}"), value);
    }
    text.trim().to_string()
}

use std::path::Path;

use minijinja::{context, AutoEscape, Environment};

use crate::inference::message::Message;

const TEMPLATE_NAME: &str = "chat";

// User/assistant subset of the Qwen3-VL chat template, without tool calling.
pub const QWEN3_VL_CHAT_TEMPLATE: &str = "{% for message in messages %}{{ '<|im_start|>' ~ message.role ~ '\\n' }}{% if message.content is string %}{{ message.content }}{% else %}{% for part in message.content %}{% if part.type == 'image' %}{{ '<|vision_start|><|image_pad|><|vision_end|>' }}{% elif part.type == 'video' %}{{ '<|vision_start|><|video_pad|><|vision_end|>' }}{% elif part.type == 'text' %}{{ part.text }}{% endif %}{% endfor %}{% endif %}{{ '<|im_end|>\\n' }}{% endfor %}{% if add_generation_prompt %}{{ '<|im_start|>assistant\\n' }}{% endif %}";

/// Renders a message list into the prompt string the model was trained on.
pub struct ChatTemplate {
    env: Environment<'static>,
}

impl ChatTemplate {
    pub fn qwen3_vl() -> Result<Self, minijinja::Error> {
        Self::from_source(QWEN3_VL_CHAT_TEMPLATE.to_string())
    }

    pub fn from_source(source: String) -> Result<Self, minijinja::Error> {
        let mut env = Environment::new();
        // plain text prompt, not HTML
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.add_template_owned(TEMPLATE_NAME, source)?;
        Ok(Self { env })
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Ok(Self::from_source(source)?)
    }

    pub fn render(
        &self,
        messages: &[Message],
        add_generation_prompt: bool,
    ) -> Result<String, minijinja::Error> {
        self.env.get_template(TEMPLATE_NAME)?.render(context! {
            messages => messages,
            add_generation_prompt => add_generation_prompt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::message::ContentPart;

    #[test]
    fn renders_text_and_video_with_generation_prompt() {
        let template = ChatTemplate::qwen3_vl().unwrap();
        let messages = vec![Message::user(vec![
            ContentPart::text("Describe this video in detail."),
            ContentPart::video("/tmp/clip.mp4"),
        ])];

        let rendered = template.render(&messages, true).unwrap();
        assert_eq!(
            rendered,
            "<|im_start|>user\nDescribe this video in detail.<|vision_start|><|video_pad|><|vision_end|><|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn omits_generation_prompt_when_disabled() {
        let template = ChatTemplate::qwen3_vl().unwrap();
        let messages = vec![Message::user(vec![ContentPart::text("hi")])];

        let rendered = template.render(&messages, false).unwrap();
        assert_eq!(rendered, "<|im_start|>user\nhi<|im_end|>\n");
    }

    #[test]
    fn rejects_malformed_template() {
        assert!(ChatTemplate::from_source("{% for x in %}".to_string()).is_err());
    }
}

//! The single page the server renders: video input, prompt, token slider and the response box.

use minijinja::{context, Environment};
use serde::Serialize;

use crate::inference::handler::DEFAULT_PROMPT;
use crate::inference::models::model::ModelBase;
use crate::theme::Theme;

pub const TITLE: &str = "SAGE-MM-Video-Reasoning";
pub const PROMPT_PLACEHOLDER: &str = "Type your question here...";
pub const RESPONSE_LINES: usize = 23;
pub const VIDEO_HEIGHT: usize = 350;
/// URL prefix the example videos are served under.
pub const EXAMPLES_ROUTE: &str = "example-videos";
pub const EXAMPLE_VIDEOS: [&str; 5] = ["1.mp4", "2.mp4", "3.mp4", "4.mp4", "5.mp4"];

const CUSTOM_CSS: &str = "#main-title h1 {font-size: 2.4em !important;}";
const PAGE_TEMPLATE: &str = include_str!("index.html");

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Slider {
    pub label: &'static str,
    pub info: &'static str,
    pub minimum: usize,
    pub maximum: usize,
    pub step: usize,
    pub value: usize,
}

impl Slider {
    /// Whether the widget could have produced `value`: in bounds and on a step.
    pub fn accepts(&self, value: f64) -> bool {
        if value.fract() != 0.0 || value < self.minimum as f64 || value > self.maximum as f64 {
            return false;
        }
        (value as usize - self.minimum) % self.step == 0
    }
}

pub const MAX_NEW_TOKENS: Slider = Slider {
    label: "Max New Tokens",
    info: "Controls the length of the generated text.",
    minimum: 128,
    maximum: 4096,
    step: 128,
    value: 1024,
};

pub fn is_example(name: &str) -> bool {
    EXAMPLE_VIDEOS.contains(&name)
}

pub fn render_page(theme: &Theme, model: &ModelBase) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.add_template("index.html", PAGE_TEMPLATE)?;
    let template = env.get_template("index.html")?;

    let examples: Vec<String> = EXAMPLE_VIDEOS
        .iter()
        .map(|name| format!("{EXAMPLES_ROUTE}/{name}"))
        .collect();
    template.render(context! {
        title => TITLE,
        model_name => model.name,
        model_url => format!("https://huggingface.co/{}", model.repo_id),
        theme_css => theme.to_css(),
        custom_css => CUSTOM_CSS,
        default_prompt => DEFAULT_PROMPT,
        placeholder => PROMPT_PLACEHOLDER,
        slider => MAX_NEW_TOKENS,
        response_lines => RESPONSE_LINES,
        video_height => VIDEO_HEIGHT,
        examples => examples,
    })
}

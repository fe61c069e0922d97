use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::inference::message::{ContentPart, Message};
use crate::inference::models::model::VisionLanguageModel;
use crate::inference::processor::{MultimodalProcessor, ProcessorInput};
use crate::inference::vision_info::{VideoError, VisionInfoExtractor};

pub const EMPTY_VIDEO_MESSAGE: &str = "Please upload a video.";
pub const DEFAULT_PROMPT: &str = "Describe this video in detail.";
pub const FRAME_ERROR_PREFIX: &str = "Error processing video frames: ";

/// Answers a prompt about a video: frame sampling, prompt construction, generation and
/// decoding. Holds the loaded model and processor read-only, so one handler serves every
/// request.
pub struct VideoHandler {
    extractor: Arc<dyn VisionInfoExtractor>,
    processor: Arc<dyn MultimodalProcessor>,
    model: Arc<dyn VisionLanguageModel>,
}

impl VideoHandler {
    pub fn new(
        extractor: Arc<dyn VisionInfoExtractor>,
        processor: Arc<dyn MultimodalProcessor>,
        model: Arc<dyn VisionLanguageModel>,
    ) -> Self {
        Self {
            extractor,
            processor,
            model,
        }
    }

    /// Returns the model's answer, or a user-facing message when there is no video or its
    /// frames cannot be sampled. Any other failure is an error.
    #[tracing::instrument(level = "info", skip(self, prompt_text))]
    pub fn process_video(
        &self,
        prompt_text: &str,
        video_reference: &str,
        max_new_tokens: usize,
    ) -> Result<String> {
        if video_reference.is_empty() {
            return Ok(EMPTY_VIDEO_MESSAGE.to_string());
        }

        let prompt = if prompt_text.trim().is_empty() {
            DEFAULT_PROMPT
        } else {
            prompt_text
        };
        let messages = vec![Message::user(vec![
            ContentPart::text(prompt),
            ContentPart::video(video_reference),
        ])];

        let vision = match self.extractor.process_vision_info(&messages) {
            Ok(vision) if !vision.videos.is_empty() => vision,
            Ok(_) => return Ok(format!("{FRAME_ERROR_PREFIX}{}", VideoError::MissingVideo)),
            Err(err) => {
                warn!("Frame sampling failed for {video_reference}: {err:#}");
                return Ok(format!("{FRAME_ERROR_PREFIX}{err}"));
            }
        };

        let text = self.processor.apply_chat_template(&messages, true)?;
        let (frames, metadata): (Vec<_>, Vec<_>) = vision
            .videos
            .into_iter()
            .map(|video| (video.frames, video.metadata))
            .unzip();
        let inputs = self
            .processor
            .process(ProcessorInput {
                videos: &frames,
                video_metadata: &metadata,
                text: &text,
                padding: true,
                video_kwargs: &vision.video_kwargs,
            })?
            .to_device(self.model.device())?;

        let input_len = inputs.input_len()?;
        let generated = self.model.generate(&inputs, max_new_tokens)?;
        let new_tokens = generated.get(input_len..).unwrap_or_default();
        info!("Decoding {} new tokens", new_tokens.len());
        self.processor.decode(new_tokens, true)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use anyhow::bail;
    use candle_core::{Device, Tensor};

    use super::*;
    use crate::inference::message::video_references;
    use crate::inference::processor::{ModelInputs, INPUT_IDS};
    use crate::inference::vision_info::{
        SampledVideo, VideoFrames, VideoKwargs, VideoMetadata, VisionInfo,
    };

    pub(crate) enum ExtractorBehavior {
        Frames,
        NoVideos,
        Fail(&'static str),
    }

    pub(crate) struct MockExtractor {
        pub behavior: ExtractorBehavior,
        pub calls: AtomicUsize,
        pub prompts: Mutex<Vec<String>>,
    }

    impl MockExtractor {
        pub fn new(behavior: ExtractorBehavior) -> Self {
            Self {
                behavior,
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    impl VisionInfoExtractor for MockExtractor {
        fn process_vision_info(&self, messages: &[Message]) -> Result<VisionInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for part in messages.iter().flat_map(|m| m.content.iter()) {
                if let ContentPart::Text { text } = part {
                    self.prompts.lock().unwrap().push(text.clone());
                }
            }
            match self.behavior {
                ExtractorBehavior::Frames => Ok(VisionInfo {
                    videos: video_references(messages)
                        .into_iter()
                        .map(|_| SampledVideo {
                            frames: VideoFrames {
                                data: vec![0; 2 * 32 * 32 * 3],
                                num_frames: 2,
                                height: 32,
                                width: 32,
                            },
                            metadata: VideoMetadata {
                                fps: 2.0,
                                frames_indices: vec![0, 1],
                                total_num_frames: 2,
                                duration: 1.0,
                                width: 32,
                                height: 32,
                                video_backend: "mock".into(),
                            },
                        })
                        .collect(),
                    video_kwargs: VideoKwargs::new(),
                }),
                ExtractorBehavior::NoVideos => Ok(VisionInfo::default()),
                ExtractorBehavior::Fail(reason) => bail!("{reason}"),
            }
        }
    }

    /// Renders messages as JSON and tokenizes every prompt to the ids `[1, 2, 3]`.
    pub(crate) struct MockProcessor;

    impl MultimodalProcessor for MockProcessor {
        fn apply_chat_template(
            &self,
            messages: &[Message],
            add_generation_prompt: bool,
        ) -> Result<String> {
            assert!(add_generation_prompt);
            Ok(serde_json::to_string(messages)?)
        }

        fn process(&self, input: ProcessorInput<'_>) -> Result<ModelInputs> {
            assert!(input.padding);
            assert_eq!(input.videos.len(), input.video_metadata.len());
            let mut inputs = ModelInputs::default();
            inputs.insert(
                INPUT_IDS,
                Tensor::new(&[1u32, 2, 3], &Device::Cpu)?.unsqueeze(0)?,
            );
            Ok(inputs)
        }

        fn decode(&self, tokens: &[u32], skip_special_tokens: bool) -> Result<String> {
            assert!(skip_special_tokens);
            Ok(tokens
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(" "))
        }
    }

    /// Echoes the prompt followed by `100, 101, ...`, one token per budget unit up to four.
    pub(crate) struct MockModel {
        pub calls: AtomicUsize,
        pub budgets: Mutex<Vec<usize>>,
        device: Device,
    }

    impl MockModel {
        pub fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                budgets: Mutex::new(Vec::new()),
                device: Device::Cpu,
            }
        }
    }

    impl VisionLanguageModel for MockModel {
        fn device(&self) -> &Device {
            &self.device
        }

        fn generate(&self, inputs: &ModelInputs, max_new_tokens: usize) -> Result<Vec<u32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.budgets.lock().unwrap().push(max_new_tokens);
            let mut tokens: Vec<u32> = inputs.get(INPUT_IDS)?.squeeze(0)?.to_vec1()?;
            tokens.extend((0..max_new_tokens.min(4) as u32).map(|i| 100 + i));
            Ok(tokens)
        }
    }

    pub(crate) fn handler(
        behavior: ExtractorBehavior,
    ) -> (VideoHandler, Arc<MockExtractor>, Arc<MockModel>) {
        let extractor = Arc::new(MockExtractor::new(behavior));
        let model = Arc::new(MockModel::new());
        let handler = VideoHandler::new(extractor.clone(), Arc::new(MockProcessor), model.clone());
        (handler, extractor, model)
    }

    #[test]
    fn empty_video_asks_for_upload() {
        let (handler, extractor, model) = handler(ExtractorBehavior::Frames);
        let output = handler.process_video("What happens?", "", 1024).unwrap();
        assert_eq!(output, "Please upload a video.");
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn blank_prompt_uses_default() {
        let (handler, extractor, _) = handler(ExtractorBehavior::Frames);
        handler.process_video("   \n\t", "clip.mp4", 128).unwrap();
        handler.process_video("", "clip.mp4", 128).unwrap();
        assert_eq!(
            *extractor.prompts.lock().unwrap(),
            vec![DEFAULT_PROMPT.to_string(), DEFAULT_PROMPT.to_string()]
        );
    }

    #[test]
    fn prompt_is_kept_verbatim() {
        let (handler, extractor, _) = handler(ExtractorBehavior::Frames);
        handler.process_video("  Who wins? ", "clip.mp4", 128).unwrap();
        assert_eq!(
            *extractor.prompts.lock().unwrap(),
            vec!["  Who wins? ".to_string()]
        );
    }

    #[test]
    fn frame_errors_are_reported_as_output() {
        let (handler, _, model) = handler(ExtractorBehavior::Fail("corrupt stream"));
        let output = handler.process_video("", "clip.mp4", 1024).unwrap();
        assert_eq!(output, "Error processing video frames: corrupt stream");
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_frames_are_reported_as_output() {
        let (handler, _, model) = handler(ExtractorBehavior::NoVideos);
        let output = handler.process_video("", "clip.mp4", 1024).unwrap();
        assert!(output.starts_with(FRAME_ERROR_PREFIX));
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn decodes_only_new_tokens() {
        let (handler, _, model) = handler(ExtractorBehavior::Frames);
        let output = handler.process_video("Describe", "clip.mp4", 1024).unwrap();
        assert_eq!(output, "100 101 102 103");
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn token_budget_is_forwarded_unchanged() {
        let (handler, _, model) = handler(ExtractorBehavior::Frames);
        handler.process_video("", "clip.mp4", 128).unwrap();
        handler.process_video("", "clip.mp4", 4096).unwrap();
        assert_eq!(*model.budgets.lock().unwrap(), vec![128, 4096]);
    }

    #[test]
    fn processor_errors_propagate() {
        struct FailingProcessor;
        impl MultimodalProcessor for FailingProcessor {
            fn apply_chat_template(&self, _: &[Message], _: bool) -> Result<String> {
                bail!("template exploded")
            }
            fn process(&self, _: ProcessorInput<'_>) -> Result<ModelInputs> {
                unreachable!()
            }
            fn decode(&self, _: &[u32], _: bool) -> Result<String> {
                unreachable!()
            }
        }

        let handler = VideoHandler::new(
            Arc::new(MockExtractor::new(ExtractorBehavior::Frames)),
            Arc::new(FailingProcessor),
            Arc::new(MockModel::new()),
        );
        let err = handler.process_video("", "clip.mp4", 128).unwrap_err();
        assert_eq!(err.to_string(), "template exploded");
    }
}

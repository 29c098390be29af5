use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
}

/// How much detail the model should spend on an image part
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    Low,
    #[default]
    Medium,
    High,
    Auto,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageContent {
    /// A remote URL or a `data:` URL carrying base64 encoded bytes
    pub url: String,
    #[serde(default)]
    pub detail: ImageDetail,
    /// Pixel width and height, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<(u32, u32)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
/// Content passed to or from an LLM
pub enum Content {
    Text(TextContent),
    Image(ImageContent),
}

impl Content {
    pub fn text<S: Into<String>>(text: S) -> Self {
        Content::Text(TextContent { text: text.into() })
    }

    pub fn image<S: Into<String>>(url: S) -> Self {
        Content::Image(ImageContent {
            url: url.into(),
            detail: ImageDetail::default(),
            dimensions: None,
        })
    }

    /// Wrap raw base64 jpeg data as an inline image part
    pub fn base64_image<S: AsRef<str>>(data: S) -> Self {
        Content::image(format!("data:image/jpeg;base64,{}", data.as_ref()))
    }

    pub fn with_detail(mut self, detail: ImageDetail) -> Self {
        if let Content::Image(image) = &mut self {
            image.detail = detail;
        }
        self
    }

    pub fn with_dimensions(mut self, width: u32, height: u32) -> Self {
        if let Content::Image(image) = &mut self {
            image.dimensions = Some((width, height));
        }
        self
    }

    /// Get the text content if this is a TextContent variant
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(&text.text),
            _ => None,
        }
    }

    /// Get the image content if this is an ImageContent variant
    pub fn as_image(&self) -> Option<&ImageContent> {
        match self {
            Content::Image(image) => Some(image),
            _ => None,
        }
    }
}

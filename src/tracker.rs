use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use image::GrayImage;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

pub trait Tracker: Send {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize);

    fn add_text(&mut self, tag: &str, text: &str, step: usize);

    fn add_image(&mut self, tag: &str, image: &GrayImage, step: usize);

    fn flush(&mut self) {}
}

/// Used when tracking is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracker;

impl Tracker for NoopTracker {
    fn add_scalar(&mut self, _tag: &str, _value: f64, _step: usize) {}

    fn add_text(&mut self, _tag: &str, _text: &str, _step: usize) {}

    fn add_image(&mut self, _tag: &str, _image: &GrayImage, _step: usize) {}
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Scalar { tag: String, value: f64, step: usize },
    Text { tag: String, text: String, step: usize },
    Image { tag: String, path: String, step: usize },
}

/// Appends one JSON object per event to `events.jsonl` and stores images as
/// PNG files under `images/`. Write failures are logged and dropped.
pub struct FileTracker {
    dir: PathBuf,
    writer: BufWriter<File>,
    image_count: usize,
}

impl FileTracker {
    pub const EVENTS_FILE: &'static str = "events.jsonl";

    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join("images"))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(Self::EVENTS_FILE))?;

        Ok(Self {
            dir,
            writer: BufWriter::new(file),
            image_count: 0,
        })
    }

    fn write(&mut self, event: &Event) {
        let written = serde_json::to_writer(&mut self.writer, event)
            .map_err(std::io::Error::from)
            .and_then(|_| self.writer.write_all(b"\n"));

        if let Err(err) = written {
            warn!(%err, dir = %self.dir.display(), "fail to write tracking event");
        }
    }
}

impl Tracker for FileTracker {
    fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
        self.write(&Event::Scalar {
            tag: tag.to_string(),
            value,
            step,
        });
    }

    fn add_text(&mut self, tag: &str, text: &str, step: usize) {
        self.write(&Event::Text {
            tag: tag.to_string(),
            text: text.to_string(),
            step,
        });
    }

    fn add_image(&mut self, tag: &str, image: &GrayImage, step: usize) {
        let relative = format!("images/{:05}-{step:04}.png", self.image_count);
        self.image_count += 1;

        if let Err(err) = image.save(self.dir.join(&relative)) {
            warn!(%err, path = %relative, "fail to write tracking image");
            return;
        }
        self.write(&Event::Image {
            tag: tag.to_string(),
            path: relative,
            step,
        });
    }

    fn flush(&mut self) {
        if let Err(err) = self.writer.flush() {
            warn!(%err, dir = %self.dir.display(), "fail to flush tracking events");
        }
    }
}

impl Drop for FileTracker {
    fn drop(&mut self) {
        Tracker::flush(self);
    }
}

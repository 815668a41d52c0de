use std::{
    fs, io,
    path::{Path, PathBuf},
};

use {
    askama::Template,
    image::{ImageFormat, Luma},
    qrcode::QrCode,
    tracing::debug,
};

/// Sub-directory of the static root holding rendered codes.
pub const QR_DIR: &str = "qr-codes";

#[derive(Debug, thiserror::Error)]
pub enum QrError {
    #[error("cannot encode QR payload: {0}")]
    Encode(#[from] qrcode::types::QrError),
    #[error("cannot write QR image: {0}")]
    Image(#[from] image::ImageError),
    #[error("QR image i/o: {0}")]
    Io(#[from] io::Error),
}

/// HTML page showing the current QR code for a session.
#[derive(Template)]
#[template(path = "qr-code.html")]
pub struct QrPage<'a> {
    pub session_name: &'a str,
    pub qr_code_img_path: String,
}

impl<'a> QrPage<'a> {
    pub fn new(session_name: &'a str) -> Self {
        Self {
            session_name,
            qr_code_img_path: QrRenderer::url_path(session_name),
        }
    }
}

/// Renders login codes to PNG files under the static directory.
#[derive(Debug, Clone)]
pub struct QrRenderer {
    static_dir: PathBuf,
    public_url: Option<String>,
}

impl QrRenderer {
    pub fn new(static_dir: impl Into<PathBuf>, public_url: Option<String>) -> Self {
        Self {
            static_dir: static_dir.into(),
            public_url,
        }
    }

    pub fn static_dir(&self) -> &Path {
        &self.static_dir
    }

    /// On-disk location of the image for `session`.
    pub fn file_path(&self, session: &str) -> PathBuf {
        self.static_dir
            .join(QR_DIR)
            .join(format!("qr_{session}.png"))
    }

    /// URL path the image is served under.
    pub fn url_path(session: &str) -> String {
        format!("/static/{QR_DIR}/qr_{session}.png")
    }

    /// Absolute address of the QR page, when a public host is configured.
    /// The session name is form-encoded, so `+` survives the round trip.
    pub fn page_url(&self, session: &str) -> Option<String> {
        let host = self.public_url.as_deref()?.trim_end_matches('/');
        let base = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };
        let mut url = reqwest::Url::parse(&format!("{base}/get-qr-code/")).ok()?;
        url.query_pairs_mut().append_pair("session_name", session);
        Some(url.into())
    }

    /// Encode `code` and replace the session's image.
    ///
    /// The PNG is written next to its final path and renamed over it, so the
    /// static handler never serves a half-written file.
    pub fn render(&self, session: &str, code: &str) -> Result<PathBuf, QrError> {
        let qr = QrCode::new(code.as_bytes())?;
        let img = qr.render::<Luma<u8>>().min_dimensions(256, 256).build();

        let path = self.file_path(session);
        let dir = self.static_dir.join(QR_DIR);
        fs::create_dir_all(&dir)?;
        let tmp = dir.join(format!(".qr_{session}.png.tmp"));
        if let Err(e) = img.save_with_format(&tmp, ImageFormat::Png) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        fs::rename(&tmp, &path)?;
        debug!(session, path = %path.display(), "QR code rendered");
        Ok(path)
    }

    /// Delete the session's image once login has finished either way.
    pub fn remove(&self, session: &str) {
        match fs::remove_file(self.file_path(session)) {
            Ok(()) => debug!(session, "QR code removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => debug!(session, error = %e, "could not remove QR code"),
        }
    }
}

//! Кодек кадров HTTP/1.1 поверх байтового потока.
//!
//! Кадр это запрос или ответ с телом фиксированной длины
//! (`Content-Length`). Chunked-кодирование не поддерживается. Заголовок
//! кадра разбирает `httparse`, имена, значения и методы проверяются
//! типами крейта `http`.

use bytes::{BufMut, Bytes, BytesMut};
use http::{header::HeaderName, HeaderValue, Method, StatusCode};
use tokio_util::codec::{Decoder, Encoder};

use crate::{BusError, BusResult};

const HEAD_END: &[u8] = b"\r\n\r\n";
const HTTP_VERSION: &str = "HTTP/1.1";
const MAX_HEADERS: usize = 64;

/// Стартовая строка кадра.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, path: String },
    Response { status: u16, reason: String },
}

/// Запрос или ответ HTTP/1.1.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpFrame {
    pub start: StartLine,
    pub headers: Vec<(String, Bytes)>,
    pub body: Bytes,
}

/// Кодек кадров с ограничением размера.
#[derive(Debug, Clone)]
pub struct HttpCodec {
    max_frame_size: usize,
    /// Сколько байт буфера уже просмотрено в поисках конца заголовка.
    scanned: usize,
    /// Разобранный заголовок, ожидающий тела.
    pending: Option<(HttpFrame, usize)>,
}

////////////////////////////////////////////////////////////////////////////////
// HttpFrame
////////////////////////////////////////////////////////////////////////////////

impl HttpFrame {
    pub fn request(
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            start: StartLine::Request {
                method: method.into(),
                path: path.into(),
            },
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn response(status: u16) -> Self {
        Self {
            start: StartLine::Response {
                status,
                reason: reason_phrase(status).to_string(),
            },
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(
        mut self,
        body: impl Into<Bytes>,
    ) -> Self {
        self.body = body.into();
        self
    }

    /// Первое значение заголовка (имя без учёта регистра).
    pub fn header(
        &self,
        name: &str,
    ) -> Option<&Bytes> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self.start {
            StartLine::Response { status, .. } => Some(status),
            StartLine::Request { .. } => None,
        }
    }
}

pub fn reason_phrase(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Unknown")
}

////////////////////////////////////////////////////////////////////////////////
// HttpCodec
////////////////////////////////////////////////////////////////////////////////

impl HttpCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            scanned: 0,
            pending: None,
        }
    }

    /// Ищет конец заголовка, продолжая с места прошлого поиска.
    ///
    /// Возвращает длину заголовка вместе с пустой строкой.
    fn find_head_end(
        &mut self,
        buf: &[u8],
    ) -> Option<usize> {
        // Разделитель мог прийти разрезанным между двумя чтениями.
        let from = self
            .scanned
            .saturating_sub(HEAD_END.len() - 1)
            .min(buf.len());
        match buf[from..]
            .windows(HEAD_END.len())
            .position(|w| w == HEAD_END)
        {
            Some(pos) => {
                self.scanned = 0;
                Some(from + pos + HEAD_END.len())
            }
            None => {
                self.scanned = buf.len();
                None
            }
        }
    }

    fn parse_head(
        &self,
        head: &[u8],
    ) -> BusResult<(HttpFrame, usize)> {
        let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let (start, fields) = if head.starts_with(b"HTTP/") {
            let mut response = httparse::Response::new(&mut parsed);
            complete(response.parse(head))?;
            let status = response
                .code
                .ok_or_else(|| BusError::protocol("response without status code"))?;
            let start = StartLine::Response {
                status,
                reason: response.reason.unwrap_or_default().to_string(),
            };
            (start, self.collect_headers(response.headers)?)
        } else {
            let mut request = httparse::Request::new(&mut parsed);
            complete(request.parse(head))?;
            let (Some(method), Some(path)) = (request.method, request.path) else {
                return Err(BusError::protocol("request without method or path"));
            };
            let start = StartLine::Request {
                method: method.to_string(),
                path: path.to_string(),
            };
            (start, self.collect_headers(request.headers)?)
        };

        let (headers, content_length) = fields;
        Ok((
            HttpFrame {
                start,
                headers,
                body: Bytes::new(),
            },
            content_length,
        ))
    }

    fn collect_headers(
        &self,
        parsed: &[httparse::Header<'_>],
    ) -> BusResult<(Vec<(String, Bytes)>, usize)> {
        let mut headers = Vec::with_capacity(parsed.len());
        let mut content_length = 0usize;
        for header in parsed {
            let value = header.value.trim_ascii();
            if header.name.eq_ignore_ascii_case("content-length") {
                content_length = std::str::from_utf8(value)
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| BusError::protocol("invalid Content-Length"))?;
            } else if header.name.eq_ignore_ascii_case("transfer-encoding")
                && value.eq_ignore_ascii_case(b"chunked")
            {
                return Err(BusError::protocol(
                    "chunked transfer encoding is not supported",
                ));
            }
            headers.push((header.name.to_string(), Bytes::copy_from_slice(value)));
        }

        if content_length > self.max_frame_size {
            return Err(BusError::FrameTooLarge {
                limit: self.max_frame_size,
            });
        }
        Ok((headers, content_length))
    }
}

/// Заголовок передаётся целиком, поэтому неполный разбор тоже ошибка.
fn complete(parsed: httparse::Result<usize>) -> BusResult<()> {
    match parsed {
        Ok(httparse::Status::Complete(_)) => Ok(()),
        Ok(httparse::Status::Partial) => Err(BusError::protocol("incomplete message head")),
        Err(err) => Err(BusError::protocol(format!("malformed message head: {err}"))),
    }
}

impl Decoder for HttpCodec {
    type Item = HttpFrame;
    type Error = BusError;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<HttpFrame>, BusError> {
        if self.pending.is_none() {
            let Some(end) = self.find_head_end(src) else {
                if src.len() > self.max_frame_size {
                    return Err(BusError::FrameTooLarge {
                        limit: self.max_frame_size,
                    });
                }
                return Ok(None);
            };
            let head = src.split_to(end);
            self.pending = Some(self.parse_head(&head)?);
        }

        let Some((_, body_len)) = &self.pending else {
            return Ok(None);
        };
        let body_len = *body_len;
        if src.len() < body_len {
            src.reserve(body_len - src.len());
            return Ok(None);
        }
        let body = src.split_to(body_len).freeze();
        Ok(self.pending.take().map(|(frame, _)| frame.with_body(body)))
    }
}

impl Encoder<HttpFrame> for HttpCodec {
    type Error = BusError;

    fn encode(
        &mut self,
        frame: HttpFrame,
        dst: &mut BytesMut,
    ) -> Result<(), BusError> {
        if frame.body.len() > self.max_frame_size {
            return Err(BusError::FrameTooLarge {
                limit: self.max_frame_size,
            });
        }
        for (name, value) in &frame.headers {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| BusError::protocol(format!("invalid header name '{name}'")))?;
            HeaderValue::from_bytes(value)
                .map_err(|_| BusError::protocol(format!("invalid value of header '{name}'")))?;
        }

        match &frame.start {
            StartLine::Request { method, path } => {
                Method::from_bytes(method.as_bytes())
                    .map_err(|_| BusError::protocol(format!("invalid method '{method}'")))?;
                if path.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
                    return Err(BusError::protocol(format!("invalid request path '{path}'")));
                }
                dst.put_slice(format!("{method} {path} {HTTP_VERSION}\r\n").as_bytes());
            }
            StartLine::Response { status, reason } => {
                dst.put_slice(format!("{HTTP_VERSION} {status} {reason}\r\n").as_bytes());
            }
        }
        for (name, value) in &frame.headers {
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            dst.put_slice(name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value);
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(format!("Content-Length: {}\r\n\r\n", frame.body.len()).as_bytes());
        dst.put_slice(&frame.body);
        Ok(())
    }
}

//! Flinch 线协议
//!
//! 每个连接只承载一个方向的一次会话:
//!
//! ```text
//! sender   -> "<fileName>::<fileSizeDecimal>::"
//! receiver -> "ACCEPT::" | "DECLINE::"
//! sender   -> <fileSize 字节原始数据>
//! ```
//!
//! 文件名中不允许出现 `::`；接收端总是把前两次出现的 `::` 当作分隔符。

use std::fmt;

/// 字段分隔符
pub const DELIMITER: &[u8] = b"::";

/// 接受令牌
pub const ACCEPT_TOKEN: &[u8] = b"ACCEPT::";

/// 拒绝令牌（两端必须一致）
pub const DECLINE_TOKEN: &[u8] = b"DECLINE::";

/// 头部在完成前允许累积的最大字节数
pub const MAX_HEADER_LEN: usize = 4096;

/// 响应令牌的最大长度
const MAX_RESPONSE_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("header exceeds {MAX_HEADER_LEN} bytes without terminator")]
    HeaderTooLong,

    #[error("file name is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("invalid file size: {0:?}")]
    InvalidSize(String),

    #[error("connection closed before header was complete")]
    TruncatedHeader,

    #[error("unexpected response token: {0:?}")]
    UnexpectedToken(String),

    #[error("connection closed before response token")]
    MissingResponse,

    #[error("received {received} body bytes but only {declared} were declared")]
    BodyOverflow { received: u64, declared: u64 },
}

/// 传输头部
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub file_name: String,
    pub size: u64,
}

impl Header {
    /// 创建头部，文件名必须能在线路上无歧义地表示
    pub fn new(file_name: impl Into<String>, size: u64) -> Result<Self, ProtocolError> {
        let file_name = file_name.into();
        validate_file_name(&file_name)?;
        if file_name.contains("::") {
            return Err(ProtocolError::InvalidFileName(file_name));
        }
        Ok(Self { file_name, size })
    }

    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}::", self.file_name, self.size)
    }
}

/// 文件名不得为空，不得包含路径分隔符
fn validate_file_name(name: &str) -> Result<(), ProtocolError> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if bad {
        return Err(ProtocolError::InvalidFileName(name.to_string()));
    }
    Ok(())
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|pos| pos + from)
}

/// 解析完成的头部，以及头部之后已经到达的正文字节
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedHeader {
    pub header: Header,
    pub body_prefix: Vec<u8>,
}

/// 增量头部解析器
///
/// 每个连接一个实例，不在连接之间共享。
#[derive(Debug, Default)]
pub struct HeaderParser {
    buf: Vec<u8>,
}

impl HeaderParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// 追加数据；头部完整时返回 `Some`
    pub fn push(&mut self, data: &[u8]) -> Result<Option<ParsedHeader>, ProtocolError> {
        self.buf.extend_from_slice(data);

        let Some(first) = find(&self.buf, DELIMITER, 0) else {
            return self.check_len();
        };
        let Some(second) = find(&self.buf, DELIMITER, first + DELIMITER.len()) else {
            return self.check_len();
        };
        if second + DELIMITER.len() > MAX_HEADER_LEN {
            return Err(ProtocolError::HeaderTooLong);
        }

        let file_name = std::str::from_utf8(&self.buf[..first])
            .map_err(|_| ProtocolError::InvalidUtf8)?
            .to_string();
        validate_file_name(&file_name)?;

        let size_field = &self.buf[first + DELIMITER.len()..second];
        let size = parse_size(size_field)?;

        let body_prefix = self.buf.split_off(second + DELIMITER.len());
        self.buf.clear();

        Ok(Some(ParsedHeader {
            header: Header { file_name, size },
            body_prefix,
        }))
    }

    fn check_len(&self) -> Result<Option<ParsedHeader>, ProtocolError> {
        if self.buf.len() > MAX_HEADER_LEN {
            Err(ProtocolError::HeaderTooLong)
        } else {
            Ok(None)
        }
    }
}

/// 只接受纯十进制数字（拒绝符号、空白和空串）
fn parse_size(field: &[u8]) -> Result<u64, ProtocolError> {
    let text = String::from_utf8_lossy(field);
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return Err(ProtocolError::InvalidSize(text.into_owned()));
    }
    text.parse()
        .map_err(|_| ProtocolError::InvalidSize(text.into_owned()))
}

/// 接收端的应答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Accept,
    Decline,
}

impl Response {
    pub fn token(self) -> &'static [u8] {
        match self {
            Response::Accept => ACCEPT_TOKEN,
            Response::Decline => DECLINE_TOKEN,
        }
    }

    /// 从已读到的字节中解析应答
    ///
    /// 令牌以 `::` 结尾；未读完时返回 `Ok(None)`。
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, ProtocolError> {
        let Some(end) = find(buf, DELIMITER, 0) else {
            if buf.len() > MAX_RESPONSE_LEN {
                return Err(ProtocolError::UnexpectedToken(
                    String::from_utf8_lossy(buf).into_owned(),
                ));
            }
            return Ok(None);
        };
        let token = &buf[..end + DELIMITER.len()];
        if token == ACCEPT_TOKEN {
            Ok(Some(Response::Accept))
        } else if token == DECLINE_TOKEN {
            Ok(Some(Response::Decline))
        } else {
            Err(ProtocolError::UnexpectedToken(
                String::from_utf8_lossy(token).into_owned(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_display() {
        let header = Header::new("report.csv", 1024).unwrap();
        assert_eq!(header.to_string(), "report.csv::1024::");
        assert_eq!(header.encode(), b"report.csv::1024::");
    }

    #[test]
    fn test_parse_with_body_prefix() {
        let mut parser = HeaderParser::new();
        let parsed = parser
            .push(b"report.csv::1024::abc")
            .unwrap()
            .expect("header complete");
        assert_eq!(parsed.header.file_name, "report.csv");
        assert_eq!(parsed.header.size, 1024);
        assert_eq!(parsed.body_prefix, b"abc");
    }

    #[test]
    fn test_parse_incremental() {
        let mut parser = HeaderParser::new();
        assert!(parser.push(b"photo.jp").unwrap().is_none());
        assert!(parser.push(b"g:").unwrap().is_none());
        assert!(parser.push(b":42:").unwrap().is_none());
        let parsed = parser.push(b":").unwrap().unwrap();
        assert_eq!(parsed.header.file_name, "photo.jpg");
        assert_eq!(parsed.header.size, 42);
        assert!(parsed.body_prefix.is_empty());
    }

    #[test]
    fn test_first_two_delimiters_win() {
        // "a::b::5::" -> 文件名 "a"，大小字段 "b"
        let mut parser = HeaderParser::new();
        let err = parser.push(b"a::b::5::").unwrap_err();
        assert_eq!(err, ProtocolError::InvalidSize("b".to_string()));
    }

    #[test]
    fn test_rejects_bad_sizes() {
        for raw in [&b"x::-5::"[..], b"x::::", b"x:: 5::", b"x::+5::", b"x::99999999999999999999::"] {
            let mut parser = HeaderParser::new();
            assert!(
                matches!(parser.push(raw), Err(ProtocolError::InvalidSize(_))),
                "{:?}",
                String::from_utf8_lossy(raw)
            );
        }
    }

    #[test]
    fn test_rejects_path_separators() {
        for raw in [&b"../etc/passwd::1::"[..], b"a\\b::1::", b"..::1::", b"::1::"] {
            let mut parser = HeaderParser::new();
            assert!(matches!(
                parser.push(raw),
                Err(ProtocolError::InvalidFileName(_))
            ));
        }
    }

    #[test]
    fn test_header_too_long() {
        let mut parser = HeaderParser::new();
        let junk = vec![b'a'; MAX_HEADER_LEN + 1];
        assert_eq!(parser.push(&junk), Err(ProtocolError::HeaderTooLong));
    }

    #[test]
    fn test_header_new_rejects_delimiter() {
        assert!(Header::new("a::b.txt", 1).is_err());
        assert!(Header::new("dir/a.txt", 1).is_err());
        assert!(Header::new("a.txt", 0).is_ok());
    }

    #[test]
    fn test_response_tokens() {
        assert_eq!(Response::parse(b"ACCEPT::").unwrap(), Some(Response::Accept));
        assert_eq!(Response::parse(b"DECLINE::").unwrap(), Some(Response::Decline));
        assert_eq!(Response::parse(b"ACCE").unwrap(), None);
        assert!(matches!(
            Response::parse(b"REJECT::"),
            Err(ProtocolError::UnexpectedToken(_))
        ));
        assert_eq!(Response::Decline.token(), DECLINE_TOKEN);
    }
}

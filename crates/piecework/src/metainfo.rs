//! Metainfo is a .torrent file with information about the torrent.
use std::path::{Component, Path, PathBuf};

use bendy::{
    decoding::{self, Decoder, FromBencode, Object, ResultExt},
    encoding::{self, AsString, SingleItemEncoder, ToBencode},
};
use sha1_smol::Sha1;

use crate::{error::Error, transfer::InfoHash};

#[derive(Debug, PartialEq, Clone, Default)]
pub struct MetaInfo {
    pub announce: String,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub comment: Option<String>,
    pub creation_date: Option<u32>,
    pub info: Info,
}

impl MetaInfo {
    /// Decode the bytes of a .torrent file.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        Ok(Self::from_bencode(buf)?)
    }

    /// Every tracker url, `announce` first, without duplicates.
    pub fn trackers(&self) -> Vec<String> {
        let mut list = vec![self.announce.clone()];

        for url in self.announce_list.iter().flatten().flatten() {
            if !list.contains(url) {
                list.push(url.clone());
            }
        }

        list.retain(|url| !url.is_empty());
        list
    }
}

/// File related information.
///
/// in a multi file format, `name` is name of the directory and
/// `file_length` is replaced by `files`.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Info {
    /// If the torrent has only 1 file, this value is some, and files is none
    pub file_length: Option<u64>,

    /// If the torrent has many files, this is some, and file_length is none.
    pub files: Option<Vec<File>>,

    pub name: String,

    /// length in bytes of each piece, the last piece may have a smaller length
    pub piece_length: usize,

    /// The concatenation of all 20-byte SHA1 hash values, one per piece.
    pub pieces: Vec<u8>,

    /// SHA-1 of the bencoded dictionary, computed while decoding.
    pub info_hash: InfoHash,
}

impl Info {
    /// How many pieces there are.
    #[inline]
    pub fn pieces(&self) -> usize {
        self.pieces.len() / 20
    }

    /// The expected hash of every piece, in order.
    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.pieces
            .chunks_exact(20)
            .map(|c| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(c);
                hash
            })
            .collect()
    }

    /// Check that the piece hashes cover exactly the size of the torrent.
    pub fn validate(&self) -> Result<(), Error> {
        if self.piece_length == 0 {
            return Err(Error::InfoInvalid("piece length is zero"));
        }
        if self.pieces.len() % 20 != 0 {
            return Err(Error::InfoInvalid("pieces is not a list of SHA-1 hashes"));
        }
        let expected = self.total_size().div_ceil(self.piece_length as u64);
        if self.pieces() as u64 != expected {
            return Err(Error::InfoInvalid(
                "the number of pieces does not match the size of the files",
            ));
        }
        Ok(())
    }

    /// Size in bytes of the files of the torrent.
    pub fn total_size(&self) -> u64 {
        match &self.files {
            Some(files) => files.iter().map(|f| f.length).sum(),
            None => self.file_length.unwrap_or(0),
        }
    }

    /// Path relative to the download dir and length of every file, in the
    /// order in which they appear in the torrent's data.
    pub fn files(&self) -> Result<Vec<(PathBuf, u64)>, Error> {
        check_component(&self.name)?;

        match (&self.files, self.file_length) {
            (Some(files), _) if !files.is_empty() => files
                .iter()
                .map(|f| {
                    if f.path.is_empty() {
                        return Err(Error::FilePathInvalid(self.name.clone()));
                    }
                    let mut path = PathBuf::from(&self.name);
                    for c in &f.path {
                        check_component(c)?;
                        path.push(c);
                    }
                    Ok((path, f.length))
                })
                .collect(),
            (None, Some(length)) => Ok(vec![(PathBuf::from(&self.name), length)]),
            _ => Err(Error::NoFiles),
        }
    }

    fn info_hash(buf: &[u8]) -> InfoHash {
        InfoHash(Sha1::from(buf).digest().bytes())
    }
}

/// A file name or folder of the torrent must be a single plain path
/// component, so that files stay inside the download dir.
fn check_component(c: &str) -> Result<(), Error> {
    let mut components = Path::new(c).components();
    let single = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();

    if !single || c.contains(['/', '\\']) {
        return Err(Error::FilePathInvalid(c.to_owned()));
    }
    Ok(())
}

/// Files in the [`Info`] are relative to the root folder name,
/// but do not contain them as the first item in the vector.
#[derive(Debug, PartialEq, Clone, Default, Hash, Eq)]
pub struct File {
    /// Length of the file in bytes.
    pub length: u64,
    /// Path of the file, excluding the parent name.
    pub path: Vec<String>,
}

impl ToBencode for File {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            e.emit_pair(b"length", self.length)?;
            e.emit_pair(b"path", &self.path)
        })?;
        Ok(())
    }
}

impl FromBencode for File {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut dict_dec = object.try_into_dictionary()?;
        let mut length = 0;
        let mut path: Vec<String> = vec![];

        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"length", value) => {
                    length = u64::decode_bencode_object(value).context("length")?;
                }
                (b"path", value) => {
                    path = Vec::<String>::decode_bencode_object(value)
                        .context("path")?;
                }
                _ => {}
            }
        }

        Ok(Self { length, path })
    }
}

impl ToBencode for Info {
    const MAX_DEPTH: usize = 5;

    fn encode(&self, encoder: SingleItemEncoder) -> Result<(), encoding::Error> {
        encoder.emit_dict(|mut e| {
            if let Some(files) = &self.files {
                e.emit_pair(b"files", files)?;
            }
            if let Some(file_length) = &self.file_length {
                e.emit_pair(b"length", file_length)?;
            }
            e.emit_pair(b"name", &self.name)?;
            e.emit_pair(b"piece length", self.piece_length)?;
            e.emit_pair(b"pieces", AsString(&self.pieces))
        })?;
        Ok(())
    }
}

impl FromBencode for MetaInfo {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut announce = None;
        let mut announce_list = None;
        let mut comment = None;
        let mut creation_date = None;
        let mut info = None;

        let mut dict_dec = object.try_into_dictionary()?;
        while let Some(pair) = dict_dec.next_pair()? {
            match pair {
                (b"announce", value) => {
                    announce = String::decode_bencode_object(value)
                        .context("announce")
                        .map(Some)?;
                }
                (b"announce-list", value) => {
                    announce_list = Vec::decode_bencode_object(value)
                        .context("announce_list")
                        .map(Some)?;
                }
                (b"comment", value) => {
                    comment = String::decode_bencode_object(value)
                        .context("comment")
                        .map(Some)?;
                }
                (b"creation date", value) => {
                    creation_date = u32::decode_bencode_object(value)
                        .context("creation_date")
                        .map(Some)?;
                }
                (b"info", value) => {
                    info = Info::decode_bencode_object(value)
                        .context("info")
                        .map(Some)?;
                }
                _ => {}
            }
        }

        // trackerless torrents leave it empty
        let announce = announce.unwrap_or_default();
        let info = info.ok_or_else(|| decoding::Error::missing_field("info"))?;

        Ok(MetaInfo { announce, announce_list, comment, creation_date, info })
    }
}

impl FromBencode for Info {
    fn decode_bencode_object(object: Object) -> Result<Self, decoding::Error>
    where
        Self: Sized,
    {
        let mut files = None;
        let mut file_length = None;
        let mut name = None;
        let mut piece_length = None;
        let mut pieces = None;

        // the raw bytes are needed for the info hash, so the dict is
        // decoded a second time from them.
        let bytes = object.try_into_dictionary()?.into_raw()?;
        let info_hash = Info::info_hash(bytes);
        let mut decoder = Decoder::new(bytes);
        let mut dict = decoder
            .next_object()?
            .ok_or_else(|| decoding::Error::missing_field("info"))?
            .try_into_dictionary()?;

        while let Some(pair) = dict.next_pair()? {
            match pair {
                (b"files", value) => {
                    files = Vec::<File>::decode_bencode_object(value)
                        .context("files")
                        .map(Some)?;
                }
                (b"length", value) => {
                    file_length = u64::decode_bencode_object(value)
                        .context("file.length")
                        .map(Some)?;
                }
                (b"name", value) => {
                    name = String::decode_bencode_object(value)
                        .context("name")
                        .map(Some)?;
                }
                (b"piece length", value) => {
                    piece_length = usize::decode_bencode_object(value)
                        .context("piece length")
                        .map(Some)?;
                }
                (b"pieces", value) => {
                    pieces = AsString::decode_bencode_object(value)
                        .context("pieces")
                        .map(|bytes| Some(bytes.0))?;
                }
                _ => {}
            }
        }

        let name = name.ok_or_else(|| decoding::Error::missing_field("name"))?;
        let piece_length = piece_length
            .ok_or_else(|| decoding::Error::missing_field("piece_length"))?;
        let pieces =
            pieces.ok_or_else(|| decoding::Error::missing_field("pieces"))?;

        Ok(Info { files, file_length, name, piece_length, pieces, info_hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_info() -> Vec<u8> {
        let mut info =
            b"d6:lengthi20e4:name7:foo.txt12:piece lengthi8e6:pieces60:"
                .to_vec();
        info.extend([1u8; 20]);
        info.extend([2u8; 20]);
        info.extend([3u8; 20]);
        info.push(b'e');
        info
    }

    fn torrent(info: &[u8]) -> Vec<u8> {
        let mut buf = b"d8:announce15:udp://t.co:133713:announce-listll15:udp://t.co:1337el13:http://b.co/aee4:info".to_vec();
        buf.extend(info);
        buf.push(b'e');
        buf
    }

    #[test]
    fn decode_single_file() {
        let info = single_file_info();
        let meta = MetaInfo::from_bytes(&torrent(&info)).unwrap();

        assert_eq!(meta.info.name, "foo.txt");
        assert_eq!(meta.info.piece_length, 8);
        assert_eq!(meta.info.pieces(), 3);
        assert_eq!(meta.info.piece_hashes()[1], [2u8; 20]);
        assert_eq!(meta.info.total_size(), 20);
        assert_eq!(
            meta.info.files().unwrap(),
            vec![(PathBuf::from("foo.txt"), 20)]
        );
        assert_eq!(
            meta.info.info_hash,
            InfoHash(Sha1::from(&info).digest().bytes())
        );
        assert_eq!(meta.trackers(), vec!["udp://t.co:1337", "http://b.co/a"]);
    }

    #[test]
    fn decode_multi_file() {
        let info = Info {
            files: Some(vec![
                File { length: 5, path: vec!["a.txt".into()] },
                File { length: 7, path: vec!["sub".into(), "b.txt".into()] },
            ]),
            name: "dir".into(),
            piece_length: 8,
            pieces: vec![0; 40],
            ..Default::default()
        };
        let info = info.to_bencode().unwrap();
        let meta = MetaInfo::from_bytes(&torrent(&info)).unwrap();

        assert_eq!(meta.info.total_size(), 12);
        assert_eq!(
            meta.info.files().unwrap(),
            vec![
                (PathBuf::from("dir/a.txt"), 5),
                (PathBuf::from("dir/sub/b.txt"), 7),
            ]
        );
    }

    #[test]
    fn decode_errors() {
        assert!(matches!(
            MetaInfo::from_bytes(b"d8:announce3:fooe"),
            Err(Error::BencodeError)
        ));
        assert!(MetaInfo::from_bytes(b"not bencode").is_err());

        let no_files = Info { name: "x".into(), ..Default::default() };
        assert!(matches!(no_files.files(), Err(Error::NoFiles)));
    }

    #[test]
    fn more_hashes_than_data() {
        // 8 bytes in pieces of 8 bytes, but 3 hashes
        let info = b"d6:lengthi8e4:name3:foo12:piece lengthi8e6:pieces60:";
        let mut info = info.to_vec();
        info.extend([0u8; 60]);
        info.push(b'e');
        let meta = MetaInfo::from_bytes(&torrent(&info)).unwrap();

        assert!(matches!(meta.info.validate(), Err(Error::InfoInvalid(_))));

        let info = Info {
            file_length: Some(20),
            name: "foo".into(),
            piece_length: 8,
            pieces: vec![0; 60],
            ..Default::default()
        };
        assert!(info.validate().is_ok());
        assert!(Info { pieces: vec![0; 59], ..info.clone() }.validate().is_err());
        assert!(Info { pieces: vec![0; 40], ..info.clone() }.validate().is_err());
        assert!(Info { piece_length: 0, ..info }.validate().is_err());
    }

    #[test]
    fn file_paths_stay_in_the_download_dir() {
        let with_path = |name: &str, path: &[&str]| Info {
            files: Some(vec![File {
                length: 4,
                path: path.iter().map(|c| c.to_string()).collect(),
            }]),
            name: name.into(),
            piece_length: 4,
            pieces: vec![0; 20],
            ..Default::default()
        };

        let paths: [&[&str]; 7] = [
            &["..", "..", "escape.bin"],
            &["/etc", "passwd"],
            &["a/../../b"],
            &["."],
            &[""],
            &["sub\\..\\x"],
            &[],
        ];
        for path in paths {
            let r = with_path("dir", path).files();
            assert!(matches!(r, Err(Error::FilePathInvalid(_))), "{path:?}");
        }

        assert!(with_path("..", &["a"]).files().is_err());
        assert!(with_path("/tmp", &["a"]).files().is_err());
        assert_eq!(
            with_path("dir", &["sub", "..a"]).files().unwrap(),
            vec![(PathBuf::from("dir/sub/..a"), 4)]
        );
    }
}

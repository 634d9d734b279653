//! Tag reading
//!
//! The player only needs artist/album/title/track number, read once when a
//! file is added to the now-playing list.

use std::fs::File;
use std::path::{ Path, PathBuf };

use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::{ MetadataOptions, StandardTagKey, Tag };
use symphonia::core::probe::Hint;
use thiserror::Error;

use crate::track::TagInfo;


/// Errors that can occur while reading tags.
#[derive( Debug, Error )]
pub enum TagError {
    #[error( "Failed to open file: {0}" )]
    Io( #[from] std::io::Error ),

    #[error( "Unsupported format: {0:?}" )]
    Unsupported( PathBuf ),
}


/// Reads tags from an audio file.
pub trait TagReader: Send + Sync {
    fn read_tags( &self, path: &Path ) -> Result<TagInfo, TagError>;
}


/// Tag reader backed by the symphonia probe.
///
/// Container-level tags (ID3v2, Vorbis comments, MP4 atoms) are read first;
/// format reader metadata only fills fields that are still missing.
#[derive( Debug, Default, Clone, Copy )]
pub struct SymphoniaTagReader;


impl SymphoniaTagReader {
    pub fn new() -> Self {
        Self
    }
}


impl TagReader for SymphoniaTagReader {
    fn read_tags( &self, path: &Path ) -> Result<TagInfo, TagError> {
        let file = File::open( path )?;
        let mss = MediaSourceStream::new( Box::new( file ), Default::default() );

        let mut hint = Hint::new();
        if let Some( ext ) = path.extension().and_then( |e| e.to_str() ) {
            hint.with_extension( ext );
        }

        let mut probed = symphonia::default::get_probe()
            .format( &hint, mss, &FormatOptions::default(), &MetadataOptions::default() )
            .map_err( |_| TagError::Unsupported( path.to_path_buf() ) )?;

        let mut info = TagInfo::default();

        if let Some( metadata_log ) = probed.metadata.get() {
            if let Some( revision ) = metadata_log.current() {
                apply_tags( &mut info, revision.tags() );
            }
        }

        if let Some( revision ) = probed.format.metadata().current() {
            apply_tags( &mut info, revision.tags() );
        }

        Ok( info )
    }
}


/// Copies standard tags into `info`, keeping fields that are already set.
fn apply_tags( info: &mut TagInfo, tags: &[Tag] ) {
    for tag in tags {
        let Some( key ) = tag.std_key else { continue };
        let slot = match key {
            StandardTagKey::Artist => &mut info.artist,
            StandardTagKey::AlbumArtist => &mut info.artist,
            StandardTagKey::Album => &mut info.album,
            StandardTagKey::TrackTitle => &mut info.title,
            StandardTagKey::TrackNumber => &mut info.track,
            _ => continue,
        };
        if slot.is_none() {
            let value = tag.value.to_string();
            if !value.trim().is_empty() {
                *slot = Some( value );
            }
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use symphonia::core::meta::Value;


    fn tag( key: StandardTagKey, value: &str ) -> Tag {
        Tag::new( Some( key ), "", Value::String( value.to_string() ) )
    }


    #[test]
    fn test_first_tag_wins() {
        let mut info = TagInfo::default();
        apply_tags( &mut info, &[
            tag( StandardTagKey::Artist, "Boards of Canada" ),
            tag( StandardTagKey::AlbumArtist, "Various" ),
            tag( StandardTagKey::TrackTitle, "Roygbiv" ),
            tag( StandardTagKey::TrackNumber, "9" ),
        ]);
        assert_eq!( info.artist.as_deref(), Some( "Boards of Canada" ) );
        assert_eq!( info.title.as_deref(), Some( "Roygbiv" ) );
        assert_eq!( info.track.as_deref(), Some( "9" ) );
        assert!( info.album.is_none() );
    }


    #[test]
    fn test_blank_values_ignored() {
        let mut info = TagInfo::default();
        apply_tags( &mut info, &[ tag( StandardTagKey::Album, "  " ) ] );
        assert!( info.album.is_none() );
    }


    #[test]
    fn test_missing_file_is_io_error() {
        let result = SymphoniaTagReader::new().read_tags( Path::new( "/definitely/not/here.mp3" ) );
        assert!( matches!( result, Err( TagError::Io( _ ) ) ) );
    }
}

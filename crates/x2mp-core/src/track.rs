//! Playlist entries
//!
//! A `TrackEntry` is the identity of one file in the now-playing list. Entries
//! are shared as `Arc<TrackEntry>`; two entries for the same path are still
//! distinct entries.

use std::path::{ Path, PathBuf };
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering };

use crate::tags::TagReader;


/// Tag fields shown for an entry.
#[derive( Debug, Clone, Default, PartialEq, Eq )]
pub struct TagInfo {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub title: Option<String>,
    pub track: Option<String>,
}


impl TagInfo {
    /// Returns true if no field is set.
    pub fn is_empty( &self ) -> bool {
        self.artist.is_none()
            && self.album.is_none()
            && self.title.is_none()
            && self.track.is_none()
    }
}


/// One entry of the now-playing list.
#[derive( Debug )]
pub struct TrackEntry {
    path: PathBuf,
    tags: TagInfo,
    /// Set by the player only. At most one entry is playing at a time.
    playing: AtomicBool,
}


impl TrackEntry {
    /// Creates an entry with already known tags.
    pub fn new( path: impl Into<PathBuf>, tags: TagInfo ) -> Arc<Self> {
        Arc::new( Self {
            path: path.into(),
            tags,
            playing: AtomicBool::new( false ),
        })
    }


    /// Creates an entry, reading its tags with `reader`.
    ///
    /// A file whose tags cannot be read still becomes an entry, with empty tags.
    pub fn from_path( path: impl Into<PathBuf>, reader: &dyn TagReader ) -> Arc<Self> {
        let path = path.into();
        let tags = match reader.read_tags( &path ) {
            Ok( tags ) => tags,
            Err( e ) => {
                tracing::warn!( "Failed to read tags from {:?}: {}", path, e );
                TagInfo::default()
            }
        };
        Self::new( path, tags )
    }


    pub fn path( &self ) -> &Path {
        &self.path
    }


    pub fn tags( &self ) -> &TagInfo {
        &self.tags
    }


    /// Whether this entry is the one currently playing.
    pub fn is_playing( &self ) -> bool {
        self.playing.load( Ordering::Acquire )
    }


    pub( crate ) fn set_playing( &self, playing: bool ) {
        self.playing.store( playing, Ordering::Release );
    }


    /// Title if tagged, otherwise the file name.
    pub fn display_name( &self ) -> String {
        if let Some( ref title ) = self.tags.title {
            return match self.tags.artist {
                Some( ref artist ) => format!( "{} - {}", artist, title ),
                None => title.clone(),
            };
        }
        self.path
            .file_name()
            .map( |n| n.to_string_lossy().into_owned() )
            .unwrap_or_else( || self.path.display().to_string() )
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::tags::TagError;


    struct FailingReader;

    impl TagReader for FailingReader {
        fn read_tags( &self, path: &Path ) -> Result<TagInfo, TagError> {
            Err( TagError::Unsupported( path.to_path_buf() ) )
        }
    }


    #[test]
    fn test_unreadable_tags_give_empty_entry() {
        let entry = TrackEntry::from_path( "/music/broken.mp3", &FailingReader );
        assert!( entry.tags().is_empty() );
        assert_eq!( entry.path(), Path::new( "/music/broken.mp3" ) );
        assert!( !entry.is_playing() );
    }


    #[test]
    fn test_display_name() {
        let tagged = TrackEntry::new( "/a/01.flac", TagInfo {
            artist: Some( "Nujabes".into() ),
            title: Some( "Aruarian Dance".into() ),
            ..TagInfo::default()
        });
        assert_eq!( tagged.display_name(), "Nujabes - Aruarian Dance" );

        let untagged = TrackEntry::new( "/a/02.flac", TagInfo::default() );
        assert_eq!( untagged.display_name(), "02.flac" );
    }


    #[test]
    fn test_same_path_distinct_entries() {
        let a = TrackEntry::new( "/a/x.ogg", TagInfo::default() );
        let b = TrackEntry::new( "/a/x.ogg", TagInfo::default() );
        assert!( !Arc::ptr_eq( &a, &b ) );
        a.set_playing( true );
        assert!( !b.is_playing() );
    }
}

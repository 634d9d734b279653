//! Now-playing list and playback history
//!
//! `Playlist` is the ordered list the user builds. `Navigator` layers a
//! history log on top of it: every entry that actually started is appended to
//! the history, and prev/next walk that history before pulling new entries
//! from the playlist.

use std::sync::Arc;

use crate::track::TrackEntry;


/// Ordered list of entries. Duplicates are allowed.
#[derive( Debug, Default, Clone )]
pub struct Playlist {
    tracks: Vec<Arc<TrackEntry>>,
}


impl Playlist {
    /// Creates a new empty playlist.
    pub fn new() -> Self {
        Self::default()
    }


    /// Adds an entry to the end of the playlist.
    pub fn add( &mut self, entry: Arc<TrackEntry> ) {
        self.tracks.push( entry );
    }


    /// Adds multiple entries to the playlist.
    pub fn add_many( &mut self, entries: impl IntoIterator<Item = Arc<TrackEntry>> ) {
        self.tracks.extend( entries );
    }


    /// Removes the entry at `index`.
    pub fn remove( &mut self, index: usize ) -> Option<Arc<TrackEntry>> {
        if index >= self.tracks.len() {
            return None;
        }
        Some( self.tracks.remove( index ) )
    }


    /// Index of this exact entry (by identity, not by path).
    pub fn position_of( &self, entry: &Arc<TrackEntry> ) -> Option<usize> {
        self.tracks.iter().position( |t| Arc::ptr_eq( t, entry ) )
    }


    pub fn get( &self, index: usize ) -> Option<&Arc<TrackEntry>> {
        self.tracks.get( index )
    }


    pub fn clear( &mut self ) {
        self.tracks.clear();
    }


    pub fn tracks( &self ) -> &[Arc<TrackEntry>] {
        &self.tracks
    }


    pub fn len( &self ) -> usize {
        self.tracks.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.tracks.is_empty()
    }
}


/// Log of started entries with a movable pointer.
#[derive( Debug, Default, Clone )]
pub struct History {
    entries: Vec<Arc<TrackEntry>>,
    /// `None` means "before the first entry".
    pointer: Option<usize>,
}


impl History {
    pub fn entries( &self ) -> &[Arc<TrackEntry>] {
        &self.entries
    }


    pub fn pointer( &self ) -> Option<usize> {
        self.pointer
    }


    pub fn len( &self ) -> usize {
        self.entries.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.entries.is_empty()
    }


    /// Entry under the pointer.
    pub fn current( &self ) -> Option<&Arc<TrackEntry>> {
        self.pointer.and_then( |p| self.entries.get( p ) )
    }


    fn push( &mut self, entry: Arc<TrackEntry> ) -> Arc<TrackEntry> {
        self.entries.push( Arc::clone( &entry ) );
        self.pointer = Some( self.entries.len() - 1 );
        entry
    }


    fn clear( &mut self ) {
        self.entries.clear();
        self.pointer = None;
    }


    /// Drops every reference to `entry`, keeping the pointer on the same
    /// surviving position.
    fn prune( &mut self, entry: &Arc<TrackEntry> ) {
        let mut index = 0;
        while index < self.entries.len() {
            if !Arc::ptr_eq( &self.entries[ index ], entry ) {
                index += 1;
                continue;
            }
            self.entries.remove( index );
            self.pointer = match self.pointer {
                Some( p ) if p > index => Some( p - 1 ),
                Some( p ) if p == index => p.checked_sub( 1 ),
                other => other,
            };
        }
        if self.entries.is_empty() {
            self.pointer = None;
        }
    }
}


/// Playlist plus history, driving prev/next.
#[derive( Debug, Default, Clone )]
pub struct Navigator {
    playlist: Playlist,
    history: History,
    /// How far into the playlist new entries have been consumed.
    cursor: Option<usize>,
}


impl Navigator {
    pub fn new() -> Self {
        Self::default()
    }


    pub fn playlist( &self ) -> &Playlist {
        &self.playlist
    }


    pub fn history( &self ) -> &History {
        &self.history
    }


    pub fn cursor( &self ) -> Option<usize> {
        self.cursor
    }


    pub fn add( &mut self, entry: Arc<TrackEntry> ) {
        self.playlist.add( entry );
    }


    /// Removes `entry` from the playlist and prunes it from the history.
    ///
    /// Returns false if the entry is not in the playlist.
    pub fn remove( &mut self, entry: &Arc<TrackEntry> ) -> bool {
        let Some( index ) = self.playlist.position_of( entry ) else {
            return false;
        };
        self.remove_at( index ).is_some()
    }


    /// Removes the entry at `index`, see [`Navigator::remove`].
    pub fn remove_at( &mut self, index: usize ) -> Option<Arc<TrackEntry>> {
        let removed = self.playlist.remove( index )?;

        // Keep the cursor pointing at the last consumed entry
        self.cursor = match self.cursor {
            Some( c ) if c >= index => c.checked_sub( 1 ),
            other => other,
        };

        // The same entry can appear twice in the playlist; only prune history
        // once no copy of that handle is left
        if self.playlist.position_of( &removed ).is_none() {
            self.history.prune( &removed );
        }

        Some( removed )
    }


    /// Moves forward: replays history if possible, otherwise takes the next
    /// unconsumed playlist entry.
    pub fn next( &mut self ) -> Option<Arc<TrackEntry>> {
        let replay = self.history.pointer.map_or( 0, |p| p + 1 );
        if replay < self.history.len() {
            self.history.pointer = Some( replay );
            return self.history.current().cloned();
        }

        let next = self.cursor.map_or( 0, |c| c + 1 );
        let entry = self.playlist.get( next )?.clone();
        self.cursor = Some( next );
        Some( self.history.push( entry ) )
    }


    /// Moves back through the history. Clamps at the first entry.
    pub fn prev( &mut self ) -> Option<Arc<TrackEntry>> {
        if self.history.is_empty() {
            return None;
        }
        let index = self.history.pointer.map_or( 0, |p| p.saturating_sub( 1 ) );
        self.history.pointer = Some( index );
        self.history.current().cloned()
    }


    /// Records a directly started entry: the cursor jumps to its playlist
    /// position and it is appended to the history.
    pub fn seed( &mut self, entry: Arc<TrackEntry> ) -> Arc<TrackEntry> {
        if let Some( index ) = self.playlist.position_of( &entry ) {
            self.cursor = Some( index );
        }
        self.history.push( entry )
    }


    /// Forgets the history and rewinds the cursor.
    pub fn reset_history( &mut self ) {
        self.history.clear();
        self.cursor = None;
    }


    /// Empties everything.
    pub fn clear( &mut self ) {
        self.playlist.clear();
        self.reset_history();
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::track::TagInfo;


    fn entry( name: &str ) -> Arc<TrackEntry> {
        TrackEntry::new( format!( "/music/{}.flac", name ), TagInfo::default() )
    }


    fn navigator( names: &[&str] ) -> ( Navigator, Vec<Arc<TrackEntry>> ) {
        let mut nav = Navigator::new();
        let entries: Vec<_> = names.iter().map( |n| entry( n ) ).collect();
        for e in &entries {
            nav.add( Arc::clone( e ) );
        }
        ( nav, entries )
    }


    fn same( a: &Option<Arc<TrackEntry>>, b: &Arc<TrackEntry> ) -> bool {
        a.as_ref().is_some_and( |a| Arc::ptr_eq( a, b ) )
    }


    #[test]
    fn test_empty_playlist_yields_nothing() {
        let mut nav = Navigator::new();
        assert!( nav.next().is_none() );
        assert!( nav.next().is_none() );
        assert!( nav.prev().is_none() );
    }


    #[test]
    fn test_visits_each_entry_once_in_order() {
        let ( mut nav, entries ) = navigator( &[ "a", "b", "c", "d" ] );
        for e in &entries {
            assert!( same( &nav.next(), e ) );
        }
        assert!( nav.next().is_none() );
        assert_eq!( nav.history().len(), 4 );
        assert_eq!( nav.cursor(), Some( 3 ) );
    }


    #[test]
    fn test_prev_next_round_trip_does_not_grow_history() {
        let ( mut nav, entries ) = navigator( &[ "a", "b", "c" ] );
        nav.next();
        nav.next();
        nav.next();
        assert!( same( &nav.prev(), &entries[ 1 ] ) );
        assert!( same( &nav.next(), &entries[ 2 ] ) );
        assert_eq!( nav.history().len(), 3 );
        assert_eq!( nav.history().pointer(), Some( 2 ) );
    }


    #[test]
    fn test_prev_clamps_at_start() {
        let ( mut nav, entries ) = navigator( &[ "a", "b" ] );
        nav.next();
        nav.next();
        assert!( same( &nav.prev(), &entries[ 0 ] ) );
        assert!( same( &nav.prev(), &entries[ 0 ] ) );
        assert!( same( &nav.prev(), &entries[ 0 ] ) );
        assert_eq!( nav.history().pointer(), Some( 0 ) );
        assert_eq!( nav.history().len(), 2 );
    }


    #[test]
    fn test_abc_scenario() {
        let ( mut nav, e ) = navigator( &[ "a", "b", "c" ] );

        assert!( same( &nav.next(), &e[ 0 ] ) );
        assert_eq!( nav.history().pointer(), Some( 0 ) );

        assert!( same( &nav.next(), &e[ 1 ] ) );
        assert_eq!( nav.history().len(), 2 );

        assert!( same( &nav.prev(), &e[ 0 ] ) );
        assert_eq!( nav.history().pointer(), Some( 0 ) );

        assert!( same( &nav.next(), &e[ 1 ] ) );
        assert_eq!( nav.history().len(), 2 );
        assert_eq!( nav.history().pointer(), Some( 1 ) );

        assert!( same( &nav.next(), &e[ 2 ] ) );
        assert_eq!( nav.history().len(), 3 );
        assert_eq!( nav.history().pointer(), Some( 2 ) );

        assert!( nav.next().is_none() );
        assert_eq!( nav.history().len(), 3 );
    }


    #[test]
    fn test_reset_history_starts_over() {
        let ( mut nav, e ) = navigator( &[ "a", "b" ] );
        nav.next();
        nav.next();
        nav.reset_history();
        assert!( nav.history().is_empty() );
        assert_eq!( nav.cursor(), None );
        assert!( same( &nav.next(), &e[ 0 ] ) );
    }


    #[test]
    fn test_seed_moves_cursor() {
        let ( mut nav, e ) = navigator( &[ "a", "b", "c", "d" ] );
        nav.next();
        nav.seed( Arc::clone( &e[ 2 ] ) );
        assert_eq!( nav.cursor(), Some( 2 ) );
        assert_eq!( nav.history().len(), 2 );
        assert!( same( &nav.next(), &e[ 3 ] ) );
        assert!( same( &nav.prev(), &e[ 2 ] ) );
        assert!( same( &nav.prev(), &e[ 0 ] ) );
    }


    #[test]
    fn test_remove_prunes_history() {
        let ( mut nav, e ) = navigator( &[ "a", "b", "c" ] );
        nav.next();
        nav.next();
        nav.next();

        assert!( nav.remove( &e[ 1 ] ) );
        assert_eq!( nav.playlist().len(), 2 );
        assert_eq!( nav.history().len(), 2 );
        assert_eq!( nav.history().pointer(), Some( 1 ) );
        assert!( same( &nav.history().current().cloned(), &e[ 2 ] ) );
        assert_eq!( nav.cursor(), Some( 1 ) );
        assert!( nav.next().is_none() );
    }


    #[test]
    fn test_remove_current_history_entry_steps_back() {
        let ( mut nav, e ) = navigator( &[ "a", "b", "c" ] );
        nav.next();
        nav.next();
        nav.remove( &e[ 1 ] );
        assert_eq!( nav.history().pointer(), Some( 0 ) );
        // c was never consumed, so it is still ahead of the cursor
        assert!( same( &nav.next(), &e[ 2 ] ) );
    }


    #[test]
    fn test_remove_unconsumed_keeps_cursor() {
        let ( mut nav, e ) = navigator( &[ "a", "b", "c" ] );
        nav.next();
        nav.remove( &e[ 1 ] );
        assert_eq!( nav.cursor(), Some( 0 ) );
        assert!( same( &nav.next(), &e[ 2 ] ) );
    }


    #[test]
    fn test_duplicates_are_distinct_until_last_copy_removed() {
        let mut nav = Navigator::new();
        let a = entry( "a" );
        nav.add( Arc::clone( &a ) );
        nav.add( Arc::clone( &a ) );
        nav.next();
        nav.remove_at( 0 );
        assert_eq!( nav.history().len(), 1 );
        nav.remove_at( 0 );
        assert!( nav.history().is_empty() );
        assert!( nav.playlist().is_empty() );
    }


    #[test]
    fn test_remove_unknown_entry() {
        let ( mut nav, _ ) = navigator( &[ "a" ] );
        assert!( !nav.remove( &entry( "a" ) ) );
        assert_eq!( nav.playlist().len(), 1 );
    }
}

//! Track decoding
//!
//! Wraps a symphonia format reader and codec for one track and hands out
//! interleaved f32 blocks. Positions are counted in source frames so the
//! channel can report where audio actually resumed after a seek.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{ Decoder as Codec, DecoderOptions, CODEC_TYPE_NULL };
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{ FormatOptions, FormatReader, SeekMode, SeekTo };
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::{ Time, TimeBase };
use thiserror::Error;


#[derive( Debug, Error )]
pub enum SourceError {
    #[error( "{0}" )]
    Io( #[from] std::io::Error ),

    #[error( "Unrecognised audio format: {0}" )]
    Format( String ),

    #[error( "File has no playable track" )]
    NoTrack,

    #[error( "Unsupported codec: {0}" )]
    Codec( String ),

    #[error( "Corrupt stream: {0}" )]
    Packet( String ),

    #[error( "Cannot seek: {0}" )]
    Seek( String ),
}


/// Converts a timestamp in `time_base` units to source frames.
fn ts_to_frames( ts: u64, time_base: Option<TimeBase>, rate: u32 ) -> u64 {
    match time_base {
        Some( tb ) => {
            let time = tb.calc_time( ts );
            ( ( time.seconds as f64 + time.frac ) * rate as f64 ).round() as u64
        }
        // Without a time base timestamps are frame counts
        None => ts,
    }
}


/// One opened track.
pub struct Decoder {
    reader: Box<dyn FormatReader>,
    codec: Box<dyn Codec>,
    track_id: u32,
    time_base: Option<TimeBase>,
    sample_rate: u32,
    channels: usize,
    total_frames: Option<u64>,
    block: Option<SampleBuffer<f32>>,
    /// Frames still to drop after a seek landed before its target
    skip_frames: u64,
}


impl Decoder {
    /// Probes `path` and prepares the first audio track for decoding.
    pub fn open( path: &Path ) -> Result<Self, SourceError> {
        let source = MediaSourceStream::new( Box::new( File::open( path )? ), Default::default() );

        let mut hint = Hint::new();
        if let Some( ext ) = path.extension().and_then( |e| e.to_str() ) {
            hint.with_extension( ext );
        }

        let format_options = FormatOptions { enable_gapless: true, ..Default::default() };
        let reader = symphonia::default::get_probe()
            .format( &hint, source, &format_options, &MetadataOptions::default() )
            .map_err( |e| SourceError::Format( e.to_string() ) )?
            .format;

        let track = reader
            .default_track()
            .filter( |t| t.codec_params.codec != CODEC_TYPE_NULL )
            .or_else( || reader.tracks().iter().find( |t| t.codec_params.codec != CODEC_TYPE_NULL ) )
            .ok_or( SourceError::NoTrack )?;

        let params = &track.codec_params;
        let codec = symphonia::default::get_codecs()
            .make( params, &DecoderOptions::default() )
            .map_err( |e| SourceError::Codec( e.to_string() ) )?;

        let sample_rate = params.sample_rate.unwrap_or( 44_100 );
        let channels = params.channels.map_or( 2, |c| c.count() );
        let decoder = Self {
            track_id: track.id,
            time_base: params.time_base,
            total_frames: params.n_frames,
            sample_rate,
            channels,
            reader,
            codec,
            block: None,
            skip_frames: 0,
        };

        tracing::debug!(
            "Decoding {:?}: {} Hz, {} ch, {:?}",
            path,
            decoder.sample_rate,
            decoder.channels,
            decoder.duration()
        );
        Ok( decoder )
    }


    pub fn sample_rate( &self ) -> u32 {
        self.sample_rate
    }


    pub fn channels( &self ) -> usize {
        self.channels
    }


    /// Track length, when the container declares a frame count.
    pub fn duration( &self ) -> Option<Duration> {
        self.total_frames
            .map( |frames| Duration::from_secs_f64( frames as f64 / self.sample_rate.max( 1 ) as f64 ) )
    }


    /// Decodes the next block of interleaved samples, or None at the end of
    /// the track. Packets the codec rejects are skipped.
    pub fn next_block( &mut self ) -> Result<Option<&[f32]>, SourceError> {
        let offset = loop {
            let packet = match self.reader.next_packet() {
                Ok( packet ) => packet,
                Err( SymphoniaError::IoError( e ) ) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok( None );
                }
                // A chained stream changed its parameters; treat it as the end
                Err( SymphoniaError::ResetRequired ) => return Ok( None ),
                Err( e ) => return Err( SourceError::Packet( e.to_string() ) ),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let audio = match self.codec.decode( &packet ) {
                Ok( audio ) => audio,
                Err( SymphoniaError::DecodeError( e ) ) => {
                    tracing::debug!( "Skipping bad packet: {}", e );
                    continue;
                }
                Err( e ) => return Err( SourceError::Packet( e.to_string() ) ),
            };

            let frames = audio.frames();
            let skip = self.skip_frames.min( frames as u64 ) as usize;
            self.skip_frames -= skip as u64;
            if skip == frames {
                continue;
            }

            let spec = *audio.spec();
            if self.block.as_ref().map_or( true, |b| b.capacity() < frames * spec.channels.count() ) {
                self.block = Some( SampleBuffer::new( frames as u64, spec ) );
            }
            if let Some( ref mut block ) = self.block {
                block.copy_interleaved_ref( audio );
            }
            break skip * spec.channels.count();
        };

        Ok( self.block.as_ref().map( |b| &b.samples()[ offset.. ] ) )
    }


    /// Moves to `position` and returns the source frame decoding resumes at.
    ///
    /// The reader lands on a packet boundary at or before the target; the
    /// frames in between are dropped from the following blocks.
    pub fn seek( &mut self, position: Duration ) -> Result<u64, SourceError> {
        let target = SeekTo::Time {
            time: Time::from( position.as_secs_f64() ),
            track_id: Some( self.track_id ),
        };
        let landed = self.reader
            .seek( SeekMode::Accurate, target )
            .map_err( |e| SourceError::Seek( e.to_string() ) )?;
        self.codec.reset();

        let required = ts_to_frames( landed.required_ts, self.time_base, self.sample_rate );
        let actual = ts_to_frames( landed.actual_ts, self.time_base, self.sample_rate );
        self.skip_frames = required.saturating_sub( actual );
        Ok( actual.max( required ) )
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_timestamps_in_sample_units() {
        let tb = TimeBase::new( 1, 44_100 );
        assert_eq!( ts_to_frames( 44_100, Some( tb ), 44_100 ), 44_100 );
        assert_eq!( ts_to_frames( 22_050, Some( tb ), 48_000 ), 24_000 );
    }


    #[test]
    fn test_timestamps_in_milliseconds() {
        let tb = TimeBase::new( 1, 1000 );
        assert_eq!( ts_to_frames( 1500, Some( tb ), 48_000 ), 72_000 );
    }


    #[test]
    fn test_timestamps_without_time_base_are_frames() {
        assert_eq!( ts_to_frames( 1234, None, 48_000 ), 1234 );
    }


    #[test]
    fn test_missing_file() {
        let result = Decoder::open( Path::new( "/nonexistent/x2mp/track.flac" ) );
        assert!( matches!( result, Err( SourceError::Io( _ ) ) ) );
    }


    #[test]
    fn test_not_audio() {
        let path = std::env::temp_dir().join( format!( "x2mp-decoder-{}.mp3", std::process::id() ) );
        std::fs::write( &path, b"definitely not an mpeg frame" ).unwrap();

        let result = Decoder::open( &path );
        let _ = std::fs::remove_file( &path );
        assert!( matches!( result, Err( SourceError::Format( _ ) ) ) );
    }
}

//! Waveform tap
//!
//! The tap is the last filter of every channel. It passes audio through
//! untouched and keeps a copy of the most recent block for visualizers.
//! The audio thread never waits on a reader: if the lock is taken it skips
//! that block.

use std::sync::Arc;
use std::sync::atomic::{ AtomicU64, Ordering };

use parking_lot::Mutex;

use crate::engine::DspProcessor;


/// Number of visualization bars produced by [`TapBuffer::vis_bars`].
pub const VIS_BARS: usize = 32;


/// Copy of one audio callback block, interleaved.
#[derive( Debug, Clone, Default, PartialEq )]
pub struct WaveformFrame {
    pub samples: Vec<f32>,
    pub frame_length: usize,
    pub channels: usize,
}


impl WaveformFrame {
    /// Samples of one channel.
    pub fn channel( &self, channel: usize ) -> impl Iterator<Item = f32> + '_ {
        self.samples
            .iter()
            .skip( channel )
            .step_by( self.channels.max( 1 ) )
            .copied()
    }


    /// RMS amplitude of `N` equal slices of the frame.
    pub fn levels<const N: usize>( &self ) -> [f32; N] {
        let mut bars = [0.0; N];
        if N == 0 || self.samples.len() < N {
            return bars;
        }
        let per_bar = self.samples.len() / N;
        for ( i, bar ) in bars.iter_mut().enumerate() {
            let slice = &self.samples[ i * per_bar..( i + 1 ) * per_bar ];
            let sum_sq: f32 = slice.iter().map( |s| s * s ).sum();
            *bar = ( sum_sq / per_bar as f32 ).sqrt();
        }
        bars
    }
}


/// Shared most-recent-block buffer.
#[derive( Debug, Default )]
pub struct TapBuffer {
    frame: Mutex<WaveformFrame>,
    generation: AtomicU64,
    skipped: AtomicU64,
}


impl TapBuffer {
    pub fn new() -> Self {
        Self::default()
    }


    /// Stores a copy of `block`. Called from the audio thread.
    ///
    /// The backing buffer is only reallocated when the block size changes.
    pub fn publish( &self, block: &[f32], channels: usize ) {
        let Some( mut frame ) = self.frame.try_lock() else {
            self.skipped.fetch_add( 1, Ordering::Relaxed );
            return;
        };
        if frame.samples.len() == block.len() {
            frame.samples.copy_from_slice( block );
        } else {
            frame.samples = block.to_vec();
        }
        frame.channels = channels;
        frame.frame_length = if channels == 0 { 0 } else { block.len() / channels };
        drop( frame );
        self.generation.fetch_add( 1, Ordering::Release );
    }


    /// Copy of the latest block.
    pub fn snapshot( &self ) -> WaveformFrame {
        self.frame.lock().clone()
    }


    /// Number of sample slots in the latest block.
    pub fn len( &self ) -> usize {
        self.frame.lock().samples.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.len() == 0
    }


    /// Increments each time a block is stored. Lets readers skip redraws.
    pub fn generation( &self ) -> u64 {
        self.generation.load( Ordering::Acquire )
    }


    /// Blocks dropped because a reader held the lock.
    pub fn skipped( &self ) -> u64 {
        self.skipped.load( Ordering::Relaxed )
    }


    /// Bar levels of the latest block for a spectrum-style display.
    pub fn vis_bars( &self ) -> [f32; VIS_BARS] {
        self.frame.lock().levels::<VIS_BARS>()
    }


    /// Clears the frame, e.g. when playback stops.
    pub fn clear( &self ) {
        let mut frame = self.frame.lock();
        frame.samples.clear();
        frame.frame_length = 0;
        frame.channels = 0;
    }
}


/// Pass-through DSP that feeds a [`TapBuffer`].
#[derive( Debug, Clone )]
pub struct TapFilter {
    buffer: Arc<TapBuffer>,
}


impl TapFilter {
    pub fn new( buffer: Arc<TapBuffer> ) -> Self {
        Self { buffer }
    }
}


impl DspProcessor for TapFilter {
    fn process( &mut self, input: &[f32], output: &mut [f32], channels: usize ) {
        output.copy_from_slice( input );
        self.buffer.publish( output, channels );
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_passes_audio_through() {
        let buffer = Arc::new( TapBuffer::new() );
        let mut filter = TapFilter::new( Arc::clone( &buffer ) );
        let input: Vec<f32> = ( 0..16 ).map( |i| i as f32 / 16.0 - 0.5 ).collect();
        let mut output = vec![ 0.0; 16 ];

        filter.process( &input, &mut output, 2 );

        assert_eq!( output, input );
        let frame = buffer.snapshot();
        assert_eq!( frame.samples, input );
        assert_eq!( frame.frame_length, 8 );
        assert_eq!( frame.channels, 2 );
    }


    #[test]
    fn test_length_tracks_latest_block() {
        let buffer = TapBuffer::new();
        buffer.publish( &[ 0.1; 512 * 2 ], 2 );
        assert_eq!( buffer.len(), 1024 );

        buffer.publish( &[ 0.2; 256 * 6 ], 6 );
        let frame = buffer.snapshot();
        assert_eq!( frame.samples.len(), 256 * 6 );
        assert_eq!( frame.frame_length * frame.channels, frame.samples.len() );
        assert!( frame.samples.iter().all( |s| *s == 0.2 ) );

        buffer.publish( &[ 0.3; 64 ], 1 );
        assert_eq!( buffer.len(), 64 );
        assert_eq!( buffer.generation(), 3 );
    }


    #[test]
    fn test_same_size_block_overwrites() {
        let buffer = TapBuffer::new();
        buffer.publish( &[ 1.0, 2.0, 3.0, 4.0 ], 2 );
        buffer.publish( &[ 5.0, 6.0, 7.0, 8.0 ], 2 );
        assert_eq!( buffer.snapshot().samples, vec![ 5.0, 6.0, 7.0, 8.0 ] );
    }


    #[test]
    fn test_skips_block_while_reader_holds_lock() {
        let buffer = TapBuffer::new();
        buffer.publish( &[ 1.0; 4 ], 2 );
        {
            let _guard = buffer.frame.lock();
            buffer.publish( &[ 2.0; 4 ], 2 );
        }
        assert_eq!( buffer.skipped(), 1 );
        assert_eq!( buffer.snapshot().samples, vec![ 1.0; 4 ] );
    }


    #[test]
    fn test_channel_iter_and_levels() {
        let frame = WaveformFrame {
            samples: vec![ 1.0, -1.0, 1.0, -1.0, 0.0, 0.0, 0.0, 0.0 ],
            frame_length: 4,
            channels: 2,
        };
        let left: Vec<f32> = frame.channel( 0 ).collect();
        assert_eq!( left, vec![ 1.0, 1.0, 0.0, 0.0 ] );

        let bars = frame.levels::<2>();
        assert!( ( bars[ 0 ] - 1.0 ).abs() < 1e-6 );
        assert_eq!( bars[ 1 ], 0.0 );
    }


    #[test]
    fn test_concurrent_reader_sees_whole_blocks() {
        let buffer = Arc::new( TapBuffer::new() );
        let writer = {
            let buffer = Arc::clone( &buffer );
            std::thread::spawn( move || {
                for i in 0..2000 {
                    let value = ( i % 7 ) as f32;
                    let len = if i % 2 == 0 { 128 } else { 96 };
                    buffer.publish( &vec![ value; len ], 2 );
                }
            })
        };

        for _ in 0..2000 {
            let frame = buffer.snapshot();
            if let Some( first ) = frame.samples.first() {
                assert!( frame.samples.iter().all( |s| s == first ) );
                assert_eq!( frame.frame_length * 2, frame.samples.len() );
            }
        }
        writer.join().unwrap();
    }
}
